//! Graphics error types.

use thiserror::Error;

/// Error type for the graphics stack.
///
/// [`GfxError::SwapchainStale`] is the only error the render path recovers
/// from (wait-idle + swapchain recreation in the frame loop); everything
/// else bubbles to the application boundary.
#[derive(Error, Debug)]
pub enum GfxError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU memory allocator error
    #[error("Allocation error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// No Vulkan-capable physical device is present
    #[error("No supported Vulkan physical device")]
    NoPhysicalDevice,

    /// A required device extension is missing
    #[error("Required device extension not supported: {0}")]
    MissingRequiredExtension(String),

    /// No queue family supports graphics, compute, and present at once
    #[error("No device queue family with graphics, compute and present support")]
    NoCompatibleQueueFamily,

    /// Surface creation failed
    #[error("Surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    /// The requested surface format/color-space pair is not supported
    #[error("Surface format not supported")]
    SurfaceFormatUnsupported,

    /// The requested present mode is not supported
    #[error("Present mode not supported")]
    PresentModeUnsupported,

    /// The swapchain is out of date or suboptimal and must be recreated
    #[error("Swapchain is stale and must be recreated")]
    SwapchainStale,

    /// The render fence did not signal within the wait timeout
    #[error("Unexpected render fence timeout")]
    RenderFenceTimeout,

    /// A resource descriptor heap ran out of free indices
    #[error("Resource descriptor heap exhausted")]
    HeapExhausted,

    /// A single staging request exceeds the staging ring capacity
    #[error("Staging request of {size} bytes exceeds ring capacity {capacity}")]
    StagingRequestTooLarge { size: u64, capacity: u64 },

    /// A frame's transient memory pool ran out of space
    #[error("Transient memory pool exhausted")]
    TransientPoolExhausted,

    /// The render graph contains a dependency cycle
    #[error("Render graph contains a cycle")]
    RenderGraphCycle,

    /// A pass references a resource the graph does not know
    #[error("Render graph references unresolved resource: {0}")]
    RenderGraphUnresolvedResource(String),

    /// Pipeline creation failed outright
    #[error("Pipeline creation failed: {0}")]
    PipelineCreationFailed(ash::vk::Result),

    /// Shader loading or reflection error
    #[error("Shader error: {0}")]
    Shader(String),

    /// IO error (pipeline cache blob persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for graphics operations.
pub type GfxResult<T> = std::result::Result<T, GfxError>;
