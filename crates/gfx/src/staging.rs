//! Host→device transfer staging.
//!
//! A single 128 MiB host-visible ring, permanently mapped. Uploads copy
//! their bytes into the ring and queue a copy record; [`StagingBuffer::flush`]
//! batches every queued copy into one command-buffer submission and waits
//! for it synchronously. When an upload would overflow the ring, a flush is
//! performed first; a single request larger than the ring fails with
//! [`GfxError::StagingRequestTooLarge`].

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::allocator::{Buffer, GpuAllocator};
use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::sync::Fence;

/// Staging ring capacity.
pub const STAGING_BUFFER_SIZE: vk::DeviceSize = 128 * 1024 * 1024;

/// One buffer-to-buffer copy region, relative to the upload's data.
#[derive(Debug, Clone, Copy)]
pub struct BufferCopyRegion {
    /// Offset into the uploaded data.
    pub src_offset: u64,
    /// Offset into the destination buffer.
    pub dst_offset: u64,
    pub size: u64,
}

impl BufferCopyRegion {
    /// Copies `size` bytes from the start of the data to the start of the
    /// destination.
    pub fn whole(size: u64) -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size,
        }
    }
}

/// One buffer-to-image copy region, relative to the upload's data.
#[derive(Debug, Clone, Copy)]
pub struct ImageCopyRegion {
    /// Offset into the uploaded data.
    pub buffer_offset: u64,
    /// Texel row length of the data, 0 = tightly packed.
    pub buffer_row_length: u32,
    /// Texel image height of the data, 0 = tightly packed.
    pub buffer_image_height: u32,
    pub subresource: vk::ImageSubresourceLayers,
    pub image_offset: vk::Offset3D,
    pub image_extent: vk::Extent3D,
}

enum Copy {
    Buffer {
        dst: vk::Buffer,
        regions: Vec<BufferCopyRegion>,
    },
    Image {
        dst: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource: vk::ImageSubresourceRange,
        regions: Vec<ImageCopyRegion>,
    },
}

/// Decision for placing an upload into the ring.
#[derive(Debug, PartialEq, Eq)]
enum Placement {
    /// Write at the current offset.
    Fits,
    /// Flush pending copies, then write at offset zero.
    FlushFirst,
}

/// Computes where an upload of `size` bytes lands in a ring of `capacity`
/// with `offset` bytes already used.
fn plan_write(offset: u64, size: u64, capacity: u64) -> GfxResult<Placement> {
    if size > capacity {
        return Err(GfxError::StagingRequestTooLarge { size, capacity });
    }
    if offset + size > capacity {
        Ok(Placement::FlushFirst)
    } else {
        Ok(Placement::Fits)
    }
}

/// Staging uploader.
pub struct StagingBuffer {
    device: Arc<Device>,
    queue: vk::Queue,
    upload_fence: Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    ring: Buffer,
    offset: u64,
    pending: Vec<Copy>,
}

impl StagingBuffer {
    /// Creates the staging ring and its dedicated command buffer.
    pub fn new(allocator: &Arc<GpuAllocator>) -> GfxResult<Self> {
        let device = allocator.device().clone();

        let upload_fence = Fence::new(device.clone(), false)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_family_index());
        let command_pool = unsafe { device.handle().create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.handle().allocate_command_buffers(&alloc_info)?[0] };

        let ring_info = vk::BufferCreateInfo::default()
            .size(STAGING_BUFFER_SIZE)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let ring = allocator.create_buffer("staging ring", &ring_info, MemoryLocation::CpuToGpu)?;

        debug!(target: "gfx", "Created staging ring: {} MiB", STAGING_BUFFER_SIZE >> 20);

        let queue = device.queue();
        Ok(Self {
            device,
            queue,
            upload_fence,
            command_pool,
            command_buffer,
            ring,
            offset: 0,
            pending: Vec::new(),
        })
    }

    /// Queues a buffer upload.
    ///
    /// `data` is copied into the ring immediately; the device-side copy
    /// happens at the next [`StagingBuffer::flush`]. Each region's
    /// `src_offset` is interpreted relative to `data`.
    pub fn upload_buffer(
        &mut self,
        dst: vk::Buffer,
        data: &[u8],
        regions: &[BufferCopyRegion],
    ) -> GfxResult<()> {
        let base = self.copy_data(data)?;
        let regions = regions
            .iter()
            .map(|region| BufferCopyRegion {
                src_offset: region.src_offset + base,
                ..*region
            })
            .collect();
        self.pending.push(Copy::Buffer { dst, regions });
        Ok(())
    }

    /// Queues an image upload with layout transitions around the copy.
    ///
    /// The image is transitioned from `old_layout` to TRANSFER_DST_OPTIMAL
    /// before the copy (unless it already is) and to `new_layout` after.
    pub fn upload_image(
        &mut self,
        dst: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource: vk::ImageSubresourceRange,
        data: &[u8],
        regions: &[ImageCopyRegion],
    ) -> GfxResult<()> {
        let base = self.copy_data(data)?;
        let regions = regions
            .iter()
            .map(|region| ImageCopyRegion {
                buffer_offset: region.buffer_offset + base,
                ..*region
            })
            .collect();
        self.pending.push(Copy::Image {
            dst,
            old_layout,
            new_layout,
            subresource,
            regions,
        });
        Ok(())
    }

    /// Submits every pending copy in insertion order and waits for
    /// completion.
    pub fn flush(&mut self) -> GfxResult<()> {
        if self.pending.is_empty() {
            self.offset = 0;
            return Ok(());
        }

        let device = self.device.handle();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(self.command_buffer, &begin_info)? };

        for copy in &self.pending {
            match copy {
                Copy::Buffer { dst, regions } => {
                    self.record_buffer_copy(*dst, regions);
                }
                Copy::Image {
                    dst,
                    old_layout,
                    new_layout,
                    subresource,
                    regions,
                } => {
                    self.record_image_copy(*dst, *old_layout, *new_layout, *subresource, regions);
                }
            }
        }

        unsafe { device.end_command_buffer(self.command_buffer)? };

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            device.queue_submit(self.queue, &[submit_info], self.upload_fence.handle())?;
        }
        self.upload_fence.wait(u64::MAX)?;
        self.upload_fence.reset()?;
        unsafe {
            device.reset_command_buffer(
                self.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
        }

        debug!(
            target: "gfx",
            "Staging flush: {} copies, {} bytes",
            self.pending.len(),
            self.offset
        );

        self.offset = 0;
        self.pending.clear();
        Ok(())
    }

    fn record_buffer_copy(&self, dst: vk::Buffer, regions: &[BufferCopyRegion]) {
        let vk_regions: Vec<vk::BufferCopy2> = regions
            .iter()
            .map(|region| {
                vk::BufferCopy2::default()
                    .src_offset(region.src_offset)
                    .dst_offset(region.dst_offset)
                    .size(region.size)
            })
            .collect();
        let copy_info = vk::CopyBufferInfo2::default()
            .src_buffer(self.ring.handle())
            .dst_buffer(dst)
            .regions(&vk_regions);
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer2(self.command_buffer, &copy_info);
        }
    }

    fn record_image_copy(
        &self,
        dst: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource: vk::ImageSubresourceRange,
        regions: &[ImageCopyRegion],
    ) {
        let device = self.device.handle();

        if old_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::COPY)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .old_layout(old_layout)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .image(dst)
                .subresource_range(subresource);
            let barriers = [barrier];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(self.command_buffer, &dependency) };
        }

        let vk_regions: Vec<vk::BufferImageCopy2> = regions
            .iter()
            .map(|region| {
                vk::BufferImageCopy2::default()
                    .buffer_offset(region.buffer_offset)
                    .buffer_row_length(region.buffer_row_length)
                    .buffer_image_height(region.buffer_image_height)
                    .image_subresource(region.subresource)
                    .image_offset(region.image_offset)
                    .image_extent(region.image_extent)
            })
            .collect();
        let copy_info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(self.ring.handle())
            .dst_image(dst)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(&vk_regions);
        unsafe { device.cmd_copy_buffer_to_image2(self.command_buffer, &copy_info) };

        if new_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::COPY)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
                .dst_access_mask(vk::AccessFlags2::NONE)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(new_layout)
                .image(dst)
                .subresource_range(subresource);
            let barriers = [barrier];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(self.command_buffer, &dependency) };
        }
    }

    /// Copies raw bytes into the ring, flushing first on overflow.
    ///
    /// Returns the ring offset the data was written at.
    fn copy_data(&mut self, data: &[u8]) -> GfxResult<u64> {
        match plan_write(self.offset, data.len() as u64, STAGING_BUFFER_SIZE)? {
            Placement::Fits => {}
            Placement::FlushFirst => self.flush()?,
        }

        let base = self.offset;
        let mapped = self
            .ring
            .mapped_ptr()
            .expect("staging ring is host visible");
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.as_ptr().add(base as usize),
                data.len(),
            );
        }
        self.offset = base + data.len() as u64;
        Ok(base)
    }
}

impl Drop for StagingBuffer {
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
    fn test_plan_write_fits() {
        assert_eq!(plan_write(0, 64, 128).unwrap(), Placement::Fits);
        assert_eq!(plan_write(64, 64, 128).unwrap(), Placement::Fits);
    }

    #[test]
    fn test_plan_write_flushes_on_overflow() {
        // Two uploads whose combined size exceeds the ring: the second
        // observes a reset offset after the forced flush.
        assert_eq!(plan_write(96, 64, 128).unwrap(), Placement::FlushFirst);
    }

    #[test]
    fn test_plan_write_rejects_oversized_request() {
        let err = plan_write(0, 256, 128).unwrap_err();
        assert!(matches!(
            err,
            GfxError::StagingRequestTooLarge {
                size: 256,
                capacity: 128
            }
        ));
    }

    #[test]
    fn test_three_64_mib_uploads_need_one_flush() {
        let chunk = 64 * 1024 * 1024;
        let mut offset = 0;
        let mut flushes = 0;
        for _ in 0..3 {
            match plan_write(offset, chunk, STAGING_BUFFER_SIZE).unwrap() {
                Placement::Fits => offset += chunk,
                Placement::FlushFirst => {
                    flushes += 1;
                    offset = chunk;
                }
            }
        }
        assert_eq!(flushes, 1);
    }
}
