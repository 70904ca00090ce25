//! Per-frame in-flight state.
//!
//! A [`Frame`] owns everything that is recycled per frame slot: the
//! image-available and render-finished semaphores, the render fence, a
//! transient command pool with one primary command buffer, a GPU profiler,
//! and a [`TransientAllocator`] for per-frame scratch buffers.
//!
//! A frame is never reused before its fence signals: [`Frame::reset`] waits
//! on the fence, then resets the fence, the command pool, and the transient
//! allocator.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::allocator::GpuAllocator;
use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::profiler::FrameProfiler;
use crate::sync::{Fence, Semaphore};

/// Size of each frame's transient memory pool.
const TRANSIENT_POOL_SIZE: vk::DeviceSize = 64 * 1024 * 1024;

/// Buffer usages transient buffers may be created with.
const TRANSIENT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

/// Linear allocator for per-frame scratch buffers.
///
/// Owns one host-visible, host-coherent (device-local preferred) memory
/// block; buffers are bump-allocated at aligned offsets into it and stay
/// valid until the next [`TransientAllocator::reset`].
pub struct TransientAllocator {
    allocator: Arc<GpuAllocator>,
    block: Option<Allocation>,
    capacity: vk::DeviceSize,
    offset: vk::DeviceSize,
    buffers: Vec<vk::Buffer>,
}

impl TransientAllocator {
    /// Creates the allocator and its backing memory block.
    pub fn new(allocator: Arc<GpuAllocator>) -> GfxResult<Self> {
        let device = allocator.device().clone();

        // Probe buffer covering every transient usage, so the block lands in
        // a memory type compatible with all of them.
        let probe_info = vk::BufferCreateInfo::default()
            .size(TRANSIENT_POOL_SIZE)
            .usage(TRANSIENT_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let probe = unsafe { device.handle().create_buffer(&probe_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(probe) };
        unsafe { device.handle().destroy_buffer(probe, None) };

        let block =
            allocator.allocate_block("transient pool", requirements, MemoryLocation::CpuToGpu, true)?;

        debug!(target: "gfx", "Created transient pool: {} MiB", TRANSIENT_POOL_SIZE >> 20);

        Ok(Self {
            allocator,
            block: Some(block),
            capacity: TRANSIENT_POOL_SIZE,
            offset: 0,
            buffers: Vec::new(),
        })
    }

    /// Creates a transient buffer and returns its handle plus the mapped
    /// host pointer.
    ///
    /// The buffer is valid until the next [`TransientAllocator::reset`].
    ///
    /// # Errors
    ///
    /// Returns [`GfxError::TransientPoolExhausted`] when the pool cannot fit
    /// the request this frame.
    pub fn create_buffer(
        &mut self,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> GfxResult<(vk::Buffer, NonNull<u8>)> {
        debug_assert!(TRANSIENT_USAGE.contains(usage));
        let device = self.allocator.device().handle();
        let block = self.block.as_ref().expect("transient pool is allocated");

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let aligned = align_up(self.offset, requirements.alignment);
        if aligned + requirements.size > self.capacity {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(GfxError::TransientPoolExhausted);
        }

        unsafe {
            device.bind_buffer_memory(buffer, block.memory(), block.offset() + aligned)?;
        }

        let mapped = block
            .mapped_ptr()
            .expect("transient pool is host visible")
            .cast::<u8>();
        let ptr = unsafe { NonNull::new_unchecked(mapped.as_ptr().add(aligned as usize)) };

        self.offset = aligned + requirements.size;
        self.buffers.push(buffer);
        Ok((buffer, ptr))
    }

    /// Creates a transient buffer initialized with `data`.
    pub fn create_buffer_with_data<T: Pod>(
        &mut self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> GfxResult<vk::Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let (buffer, ptr) = self.create_buffer(usage, bytes.len() as vk::DeviceSize)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        Ok(buffer)
    }

    /// Destroys all buffers allocated this frame and rewinds the pool.
    pub fn reset(&mut self) {
        let device = self.allocator.device().handle();
        for buffer in self.buffers.drain(..) {
            unsafe { device.destroy_buffer(buffer, None) };
        }
        self.offset = 0;
    }
}

impl Drop for TransientAllocator {
    fn drop(&mut self) {
        self.reset();
        if let Some(block) = self.block.take() {
            self.allocator.free_block(block);
        }
    }
}

fn align_up(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// One in-flight frame slot.
pub struct Frame {
    device: Arc<Device>,
    queue: vk::Queue,
    image_available: Semaphore,
    render_finished: Semaphore,
    render_fence: Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    profiler: FrameProfiler,
    transient: TransientAllocator,
}

impl Frame {
    /// Creates a frame slot with its own command pool, sync objects,
    /// profiler, and transient pool.
    pub fn new(device: Arc<Device>, allocator: &Arc<GpuAllocator>) -> GfxResult<Self> {
        let image_available = Semaphore::new(device.clone())?;
        let render_finished = Semaphore::new(device.clone())?;
        // Signaled, so the first reset does not block forever.
        let render_fence = Fence::new(device.clone(), true)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.queue_family_index());
        let command_pool = unsafe { device.handle().create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.handle().allocate_command_buffers(&alloc_info)?[0] };

        let profiler = FrameProfiler::new(device.clone())?;
        let transient = TransientAllocator::new(allocator.clone())?;
        let queue = device.queue();

        Ok(Self {
            device,
            queue,
            image_available,
            render_finished,
            render_fence,
            command_pool,
            command_buffer,
            profiler,
            transient,
        })
    }

    /// The device the frame records against.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Semaphore signaled when the frame's swapchain image is acquired.
    #[inline]
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available.handle()
    }

    /// Semaphore signaled when rendering of this frame completes.
    #[inline]
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished.handle()
    }

    /// The frame's primary command buffer.
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// The frame's transient allocator.
    #[inline]
    pub fn transient(&mut self) -> &mut TransientAllocator {
        &mut self.transient
    }

    /// The frame's GPU profiler.
    #[inline]
    pub fn profiler(&mut self) -> &mut FrameProfiler {
        &mut self.profiler
    }

    /// Submits the frame's command buffer.
    ///
    /// Waits on image-available at ALL_COMMANDS, signals render-finished and
    /// the render fence.
    pub fn submit(&self) -> GfxResult<()> {
        let wait_semaphores = [self.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let command_buffers = [self.command_buffer];
        let signal_semaphores = [self.render_finished.handle()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.handle().queue_submit(
                self.queue,
                &[submit_info],
                self.render_fence.handle(),
            )?;
        }
        Ok(())
    }

    /// Recycles the frame slot.
    ///
    /// Waits for the render fence (failing with
    /// [`GfxError::RenderFenceTimeout`] on timeout), resets it, collects GPU
    /// timings, and resets the command pool and transient allocator.
    pub fn reset(&mut self) -> GfxResult<()> {
        self.render_fence.wait(u64::MAX)?;
        self.render_fence.reset()?;
        self.profiler.collect()?;
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())?;
        }
        self.transient.reset();
        Ok(())
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_transient_usage_covers_scratch_cases() {
        assert!(TRANSIENT_USAGE.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(TRANSIENT_USAGE.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(TRANSIENT_USAGE.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(!TRANSIENT_USAGE.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }
}
