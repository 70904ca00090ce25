//! The device context: owner of every GPU service.
//!
//! [`DeviceContext::new`] runs the full init sequence — instance, physical
//! device, surface, queue family, logical device, swapchain, caches,
//! bindless heaps, allocator, staging ring, and the in-flight frames — and
//! exposes them to the render thread. Teardown happens in reverse through
//! field drop order.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::HasDisplayHandle;
use tracing::info;

use forge_platform::{Surface, Window};

use crate::allocator::GpuAllocator;
use crate::cache::{DescriptorSetLayoutCache, PipelineLayoutCache};
use crate::descriptor::DescriptorSetAllocator;
use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::frame::Frame;
use crate::heap::{ResourceDescriptorHeap, RESOURCE_HEAP_SIZE};
use crate::instance::Instance;
use crate::pipeline::PipelineCache;
use crate::shaders::ShaderModuleCache;
use crate::staging::StagingBuffer;
use crate::swapchain::{Swapchain, SwapchainDesc};
use crate::FRAMES_IN_FLIGHT;

/// The device context.
///
/// Field order doubles as teardown order: frames, staging, heaps, and
/// caches drop before the swapchain, which drops before the surface and
/// instance. The logical device is destroyed when its last `Arc` reference
/// goes away, after everything created from it.
pub struct DeviceContext {
    frames: Vec<Frame>,
    staging: StagingBuffer,

    buffer_heap: ResourceDescriptorHeap,
    image_heap: ResourceDescriptorHeap,
    texture_heap: ResourceDescriptorHeap,
    sampler_heap: ResourceDescriptorHeap,
    descriptor_set_allocator: DescriptorSetAllocator,

    pipeline_cache: PipelineCache,
    pipeline_layout_cache: PipelineLayoutCache,
    descriptor_set_layout_cache: DescriptorSetLayoutCache,
    shader_module_cache: ShaderModuleCache,

    swapchain: Swapchain,
    allocator: Arc<GpuAllocator>,
    device: Arc<Device>,
    surface: Surface,
    instance: Instance,

    /// Monotonically increasing frame counter; `current_frame %
    /// FRAMES_IN_FLIGHT` selects the in-flight slot.
    current_frame: u64,
}

impl DeviceContext {
    /// Initializes the full graphics stack against `window`.
    ///
    /// Validation layers and the debug messenger are enabled in debug
    /// builds.
    pub fn new(window: &Window) -> GfxResult<Self> {
        let display_handle = window
            .inner()
            .display_handle()
            .map_err(|e| GfxError::SurfaceCreationFailed(e.to_string()))?;
        let surface_extensions =
            forge_platform::window::required_instance_extensions(display_handle.as_raw())
                .map_err(|e| GfxError::SurfaceCreationFailed(e.to_string()))?;

        let instance = Instance::new(cfg!(debug_assertions), &surface_extensions)?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| GfxError::SurfaceCreationFailed(e.to_string()))?;

        let device = Device::new(&instance, &surface)?;

        let mut swapchain = Swapchain::new(device.clone(), surface.handle(), surface.loader().clone());
        swapchain.recreate(window.framebuffer_size(), &SwapchainDesc::default())?;

        let shader_module_cache = ShaderModuleCache::new(device.clone());
        let descriptor_set_layout_cache = DescriptorSetLayoutCache::new(device.clone());
        let pipeline_layout_cache = PipelineLayoutCache::new(device.clone());
        let pipeline_cache = PipelineCache::new(device.clone())?;

        let buffer_heap = ResourceDescriptorHeap::new(
            device.clone(),
            vk::DescriptorType::STORAGE_BUFFER,
            RESOURCE_HEAP_SIZE,
            0,
        )?;
        let image_heap = ResourceDescriptorHeap::new(
            device.clone(),
            vk::DescriptorType::STORAGE_IMAGE,
            RESOURCE_HEAP_SIZE,
            0,
        )?;
        let texture_heap = ResourceDescriptorHeap::new(
            device.clone(),
            vk::DescriptorType::SAMPLED_IMAGE,
            RESOURCE_HEAP_SIZE,
            0,
        )?;
        let sampler_heap = ResourceDescriptorHeap::new(
            device.clone(),
            vk::DescriptorType::SAMPLER,
            RESOURCE_HEAP_SIZE,
            0,
        )?;
        let descriptor_set_allocator = DescriptorSetAllocator::new(device.clone());

        let allocator = GpuAllocator::new(&instance, device.clone())?;
        let staging = StagingBuffer::new(&allocator)?;

        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|_| Frame::new(device.clone(), &allocator))
            .collect::<GfxResult<Vec<_>>>()?;

        info!(target: "gfx", "Device context initialized ({} frames in flight)", FRAMES_IN_FLIGHT);

        Ok(Self {
            frames,
            staging,
            buffer_heap,
            image_heap,
            texture_heap,
            sampler_heap,
            descriptor_set_allocator,
            pipeline_cache,
            pipeline_layout_cache,
            descriptor_set_layout_cache,
            shader_module_cache,
            swapchain,
            allocator,
            device,
            surface,
            instance,
            current_frame: 0,
        })
    }

    /// The logical device.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Arc<GpuAllocator> {
        &self.allocator
    }

    /// The swapchain driver.
    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    #[inline]
    pub fn swapchain_mut(&mut self) -> &mut Swapchain {
        &mut self.swapchain
    }

    /// The monotonically increasing frame counter.
    #[inline]
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Index of the current in-flight frame slot.
    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.current_frame % FRAMES_IN_FLIGHT as u64) as usize
    }

    /// The current in-flight frame.
    #[inline]
    pub fn current_frame_ref(&self) -> &Frame {
        &self.frames[(self.current_frame % FRAMES_IN_FLIGHT as u64) as usize]
    }

    #[inline]
    pub fn current_frame_mut(&mut self) -> &mut Frame {
        let index = self.frame_index();
        &mut self.frames[index]
    }

    /// Storage-buffer bindless heap.
    #[inline]
    pub fn buffer_heap(&self) -> &ResourceDescriptorHeap {
        &self.buffer_heap
    }

    #[inline]
    pub fn buffer_heap_mut(&mut self) -> &mut ResourceDescriptorHeap {
        &mut self.buffer_heap
    }

    /// Storage-image bindless heap.
    #[inline]
    pub fn image_heap(&self) -> &ResourceDescriptorHeap {
        &self.image_heap
    }

    #[inline]
    pub fn image_heap_mut(&mut self) -> &mut ResourceDescriptorHeap {
        &mut self.image_heap
    }

    /// Sampled-image bindless heap.
    #[inline]
    pub fn texture_heap(&self) -> &ResourceDescriptorHeap {
        &self.texture_heap
    }

    #[inline]
    pub fn texture_heap_mut(&mut self) -> &mut ResourceDescriptorHeap {
        &mut self.texture_heap
    }

    /// Sampler bindless heap.
    #[inline]
    pub fn sampler_heap(&self) -> &ResourceDescriptorHeap {
        &self.sampler_heap
    }

    #[inline]
    pub fn sampler_heap_mut(&mut self) -> &mut ResourceDescriptorHeap {
        &mut self.sampler_heap
    }

    /// The staging uploader.
    #[inline]
    pub fn staging_mut(&mut self) -> &mut StagingBuffer {
        &mut self.staging
    }

    /// The per-1024 descriptor set allocator.
    #[inline]
    pub fn descriptor_set_allocator_mut(&mut self) -> &mut DescriptorSetAllocator {
        &mut self.descriptor_set_allocator
    }

    /// Borrows everything pipeline construction needs in one bundle.
    pub fn pipeline_resources(&mut self) -> PipelineResources<'_> {
        PipelineResources {
            device: self.device.clone(),
            shader_modules: &mut self.shader_module_cache,
            pipeline_cache: &self.pipeline_cache,
            pipeline_layouts: &mut self.pipeline_layout_cache,
            set_layouts: &mut self.descriptor_set_layout_cache,
            buffer_heap: &self.buffer_heap,
            image_heap: &self.image_heap,
            texture_heap: &self.texture_heap,
            sampler_heap: &self.sampler_heap,
        }
    }

    /// Flushes pending staging copies and descriptor heap writes.
    ///
    /// Call after a burst of resource creation (scene upload) and before
    /// the first draw that may reference the new descriptors.
    pub fn flush(&mut self) -> GfxResult<()> {
        self.staging.flush()?;
        self.buffer_heap.flush();
        self.image_heap.flush();
        self.texture_heap.flush();
        self.sampler_heap.flush();
        Ok(())
    }

    /// Advances to the next frame.
    ///
    /// Bumps the frame counter, advances heap index retirement, and forwards
    /// the counter to the allocator for budget bookkeeping.
    pub fn next_frame(&mut self) {
        self.current_frame += 1;
        self.buffer_heap.advance(self.current_frame);
        self.image_heap.advance(self.current_frame);
        self.texture_heap.advance(self.current_frame);
        self.sampler_heap.advance(self.current_frame);
        self.allocator.set_current_frame_index(self.current_frame);
    }

    /// Waits for the device to idle. Teardown and swapchain recreation only.
    pub fn wait_idle(&self) -> GfxResult<()> {
        self.device.wait_idle()
    }

    /// Recreates the swapchain for a new framebuffer size.
    ///
    /// Waits for the device to idle first, so no in-flight work references
    /// the old swapchain images.
    pub fn recreate_swapchain(&mut self, extent: (u32, u32)) -> GfxResult<()> {
        self.device.wait_idle()?;
        self.swapchain.recreate(extent, &SwapchainDesc::default())
    }

    /// Persists the pipeline cache blob. Called by the engine on teardown.
    pub fn save_pipeline_cache(&self) -> GfxResult<()> {
        self.pipeline_cache.save()
    }

    /// Whether the given device extension was enabled at init.
    pub fn is_extension_enabled(&self, name: &CStr) -> bool {
        self.device.is_extension_enabled(name)
    }
}

/// Disjoint borrows of the pipeline-construction services.
///
/// Load shader modules first, then hand the cache references to a
/// [`crate::pipeline::GraphicsPipelineBuilder`] or
/// [`crate::pipeline::ComputePipelineBuilder`].
pub struct PipelineResources<'a> {
    pub device: Arc<Device>,
    pub shader_modules: &'a mut ShaderModuleCache,
    pub pipeline_cache: &'a PipelineCache,
    pub pipeline_layouts: &'a mut PipelineLayoutCache,
    pub set_layouts: &'a mut DescriptorSetLayoutCache,
    pub buffer_heap: &'a ResourceDescriptorHeap,
    pub image_heap: &'a ResourceDescriptorHeap,
    pub texture_heap: &'a ResourceDescriptorHeap,
    pub sampler_heap: &'a ResourceDescriptorHeap,
}
