//! GPU memory allocation with typed ownership handles.
//!
//! Wraps `gpu-allocator` behind [`GpuAllocator`] and provides RAII
//! [`Buffer`] and [`Image`] types that free their allocation and destroy
//! their Vulkan object on drop.
//!
//! Aliased placement (several resources over one allocation, used by the
//! render graph for transient resources and by the per-frame transient
//! pool) is expressed as a raw [`GpuAllocator::allocate_block`] plus
//! `bind_buffer_memory` / `bind_image_memory` calls at offsets into the
//! block.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::GfxResult;
use crate::instance::Instance;

/// GPU memory allocator wrapper.
///
/// The inner allocator is behind a `Mutex` per the library contract; in this
/// runtime it is only ever driven from the render thread.
pub struct GpuAllocator {
    device: Arc<Device>,
    inner: Mutex<Allocator>,
    /// Advisory frame counter for budget bookkeeping (see
    /// [`GpuAllocator::set_current_frame_index`]).
    current_frame: AtomicU64,
}

impl GpuAllocator {
    /// Creates the allocator for the given device.
    pub fn new(instance: &Instance, device: Arc<Device>) -> GfxResult<Arc<Self>> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.handle().clone(),
            physical_device: device.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        info!(target: "gfx", "GPU memory allocator initialized");

        Ok(Arc::new(Self {
            device,
            inner: Mutex::new(allocator),
            current_frame: AtomicU64::new(0),
        }))
    }

    /// Returns the device this allocator serves.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Records the current frame index.
    ///
    /// Advisory only: gpu-allocator has no per-frame hint, so the value is
    /// kept for memory report logging.
    pub fn set_current_frame_index(&self, frame: u64) {
        self.current_frame.store(frame, Ordering::Relaxed);
    }

    /// Allocates a raw memory block.
    ///
    /// Used for aliased render-graph transients and the per-frame transient
    /// pool; the caller binds buffers/images at offsets into the block.
    pub fn allocate_block(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> GfxResult<Allocation> {
        let allocation = self.inner.lock().unwrap().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(allocation)
    }

    /// Returns a memory block to the allocator.
    pub fn free_block(&self, allocation: Allocation) {
        if let Err(e) = self.inner.lock().unwrap().free(allocation) {
            tracing::error!(target: "gfx", "Failed to free allocation: {:?}", e);
        }
    }

    /// Creates a buffer with bound memory.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer creation or memory allocation fails
    /// (including out-of-device-memory).
    pub fn create_buffer(
        self: &Arc<Self>,
        name: &str,
        info: &vk::BufferCreateInfo,
        location: MemoryLocation,
    ) -> GfxResult<Buffer> {
        let device = self.device.handle();
        let buffer = unsafe { device.create_buffer(info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate_block(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        unsafe {
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        debug!(target: "gfx", "Created buffer '{}': {} bytes", name, info.size);

        Ok(Buffer {
            allocator: self.clone(),
            buffer,
            allocation: Some(allocation),
            size: info.size,
        })
    }

    /// Creates an image with bound memory.
    pub fn create_image(
        self: &Arc<Self>,
        name: &str,
        info: &vk::ImageCreateInfo,
        location: MemoryLocation,
    ) -> GfxResult<Image> {
        let device = self.device.handle();
        let image = unsafe { device.create_image(info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match self.allocate_block(name, requirements, location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        unsafe {
            device.bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        debug!(
            target: "gfx",
            "Created image '{}': {}x{} {:?}",
            name, info.extent.width, info.extent.height, info.format
        );

        Ok(Image {
            allocator: self.clone(),
            image,
            allocation: Some(allocation),
            extent: vk::Extent2D {
                width: info.extent.width,
                height: info.extent.height,
            },
            format: info.format,
        })
    }
}

/// GPU buffer with owned memory.
///
/// The allocation is freed and the buffer destroyed on drop. A buffer must
/// outlive any in-flight GPU use; typically it is held in a struct whose
/// lifetime spans all frames that could reference it.
pub struct Buffer {
    allocator: Arc<GpuAllocator>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Returns the persistently mapped pointer for host-visible buffers.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.cast())
    }

    /// Writes data into a host-visible buffer at the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the write exceeds the buffer size or the
    /// buffer is not host-visible.
    pub fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.size as usize);
        let mapped = self
            .mapped_ptr()
            .expect("write() requires a host-visible buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().add(offset), data.len());
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free_block(allocation);
        }
        unsafe {
            self.allocator
                .device
                .handle()
                .destroy_buffer(self.buffer, None);
        }
    }
}

/// GPU image with owned memory.
pub struct Image {
    allocator: Arc<GpuAllocator>,
    image: vk::Image,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl Image {
    /// Returns the Vulkan image handle.
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Returns the image extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free_block(allocation);
        }
        unsafe {
            self.allocator
                .device
                .handle()
                .destroy_image(self.image, None);
        }
    }
}
