//! Vulkan graphics services for the Forge render runtime.
//!
//! This crate provides the device context and everything it glues together:
//! - Instance and device creation (Vulkan 1.3, bindless + sync2 + dynamic
//!   rendering feature set)
//! - Memory allocation with typed ownership handles
//! - Swapchain management with out-of-date recovery as a value
//! - Per-frame in-flight state (command pool, semaphores, fence, transient
//!   linear allocator, GPU profiler)
//! - Bindless resource descriptor heaps
//! - Content-addressed shader / layout / pipeline caches
//! - Staging uploads through a bounded host-visible ring

mod error;

pub mod allocator;
pub mod cache;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod heap;
pub mod instance;
pub mod pipeline;
pub mod profiler;
pub mod shaders;
pub mod staging;
pub mod swapchain;
pub mod sync;

pub use error::{GfxError, GfxResult};

// Re-export ash types that users might need
pub use ash::vk;

/// Number of frames that may be in flight at once.
///
/// A frame slot is recycled only after its render fence signals;
/// `current_frame % FRAMES_IN_FLIGHT` selects the slot.
pub const FRAMES_IN_FLIGHT: usize = 3;
