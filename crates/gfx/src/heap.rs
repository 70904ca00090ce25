//! Bindless resource descriptor heaps.
//!
//! One heap per descriptor type (storage buffer, storage image, sampled
//! image, sampler): a single large UPDATE_AFTER_BIND descriptor array with
//! stable 32-bit indices. Shaders index the array directly; the CPU side
//! hands out indices from a free list and batches descriptor writes until
//! [`ResourceDescriptorHeap::flush`].
//!
//! Freed indices are not reused immediately: they sit in a retirement queue
//! until [`crate::FRAMES_IN_FLIGHT`] frames have advanced, so no in-flight
//! command buffer can still reference a recycled slot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::FRAMES_IN_FLIGHT;

/// Default heap size (1M descriptors).
pub const RESOURCE_HEAP_SIZE: u32 = 1024 * 1024;

/// Free-list + retirement-queue index bookkeeping.
///
/// Pure state machine, kept separate from the Vulkan objects so the
/// allocate/free/retire invariants are directly testable.
struct IndexPool {
    size: u32,
    free: Vec<u32>,
    retired: VecDeque<(u64, u32)>,
    frame: u64,
}

impl IndexPool {
    fn new(size: u32) -> Self {
        let mut pool = Self {
            size,
            free: Vec::new(),
            retired: VecDeque::new(),
            frame: 0,
        };
        pool.reset();
        pool
    }

    /// Hands out the lowest free index.
    fn allocate(&mut self) -> Option<u32> {
        self.free.pop()
    }

    /// Retires an index; it becomes allocatable again once enough frames
    /// have advanced.
    fn free(&mut self, index: u32) {
        debug_assert!(index < self.size);
        self.retired.push_back((self.frame, index));
    }

    /// Advances the frame counter and reclaims indices whose retirement
    /// frame is at least `FRAMES_IN_FLIGHT` behind.
    fn advance(&mut self, frame: u64) {
        self.frame = frame;
        while let Some(&(retired_at, index)) = self.retired.front() {
            if retired_at + FRAMES_IN_FLIGHT as u64 > frame {
                break;
            }
            self.retired.pop_front();
            self.free.push(index);
        }
    }

    /// Restores the full free list, in descending order so index 0 is
    /// handed out first.
    fn reset(&mut self) {
        self.retired.clear();
        self.free.clear();
        self.free.reserve(self.size as usize);
        for i in 0..self.size {
            self.free.push(self.size - i - 1);
        }
        self.frame = 0;
    }
}

/// A pending descriptor write.
#[derive(Clone, Copy)]
enum DescriptorWrite {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

/// Move-only owner of a heap index.
///
/// Dropping the handle retires the index back to its heap; the heap drains
/// dropped indices on its next flush or frame advance. The shared queue
/// keeps the handle free of borrows into the heap.
pub struct HeapHandle {
    index: u32,
    dropped: Arc<Mutex<Vec<u32>>>,
}

impl HeapHandle {
    /// The bindless index, as referenced from shaders.
    #[inline]
    pub fn get(&self) -> u32 {
        self.index
    }
}

impl Drop for HeapHandle {
    fn drop(&mut self) {
        self.dropped.lock().unwrap().push(self.index);
    }
}

/// A large update-after-bind descriptor array with stable indices.
pub struct ResourceDescriptorHeap {
    device: Arc<Device>,
    ty: vk::DescriptorType,
    size: u32,
    binding: u32,

    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,

    indices: IndexPool,
    pending: Vec<(u32, DescriptorWrite)>,
    dropped: Arc<Mutex<Vec<u32>>>,
}

impl ResourceDescriptorHeap {
    /// Creates a heap of `size` descriptors of type `ty` at `binding`.
    pub fn new(
        device: Arc<Device>,
        ty: vk::DescriptorType,
        size: u32,
        binding: u32,
    ) -> GfxResult<Self> {
        let sizes = [vk::DescriptorPoolSize::default().ty(ty).descriptor_count(size)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&sizes);
        let pool = unsafe { device.handle().create_descriptor_pool(&pool_info, None)? };

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(size)
            .stage_flags(vk::ShaderStageFlags::ALL)];
        let binding_flags = [vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&layout_info, None)?
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { device.handle().allocate_descriptor_sets(&alloc_info)?[0] };

        debug!(
            target: "gfx",
            "Created {:?} descriptor heap: {} entries at binding {}",
            ty, size, binding
        );

        Ok(Self {
            device,
            ty,
            size,
            binding,
            pool,
            layout,
            set,
            indices: IndexPool::new(size),
            pending: Vec::new(),
            dropped: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The heap's descriptor set layout, for pipeline layout construction.
    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The heap's descriptor set, bound once per pipeline.
    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// The heap's descriptor type.
    #[inline]
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.ty
    }

    /// Number of descriptor slots in the heap.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Allocates an index for a storage buffer range.
    pub fn allocate_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> GfxResult<u32> {
        debug_assert_eq!(self.ty, vk::DescriptorType::STORAGE_BUFFER);
        let index = self.allocate_index()?;
        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(range);
        self.pending.push((index, DescriptorWrite::Buffer(info)));
        Ok(index)
    }

    /// Allocates an index for an image view in the given layout.
    pub fn allocate_image(
        &mut self,
        image_view: vk::ImageView,
        image_layout: vk::ImageLayout,
    ) -> GfxResult<u32> {
        debug_assert!(
            self.ty == vk::DescriptorType::STORAGE_IMAGE
                || self.ty == vk::DescriptorType::SAMPLED_IMAGE
        );
        let index = self.allocate_index()?;
        let info = vk::DescriptorImageInfo::default()
            .image_view(image_view)
            .image_layout(image_layout);
        self.pending.push((index, DescriptorWrite::Image(info)));
        Ok(index)
    }

    /// Allocates an index for a sampler.
    pub fn allocate_sampler(&mut self, sampler: vk::Sampler) -> GfxResult<u32> {
        debug_assert_eq!(self.ty, vk::DescriptorType::SAMPLER);
        let index = self.allocate_index()?;
        let info = vk::DescriptorImageInfo::default().sampler(sampler);
        self.pending.push((index, DescriptorWrite::Image(info)));
        Ok(index)
    }

    /// Like [`Self::allocate_buffer`], returning a move-only handle that
    /// retires the index on drop.
    pub fn allocate_buffer_unique(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> GfxResult<HeapHandle> {
        let index = self.allocate_buffer(buffer, offset, range)?;
        Ok(self.unique(index))
    }

    /// Like [`Self::allocate_image`], returning a move-only handle.
    pub fn allocate_image_unique(
        &mut self,
        image_view: vk::ImageView,
        image_layout: vk::ImageLayout,
    ) -> GfxResult<HeapHandle> {
        let index = self.allocate_image(image_view, image_layout)?;
        Ok(self.unique(index))
    }

    /// Like [`Self::allocate_sampler`], returning a move-only handle.
    pub fn allocate_sampler_unique(&mut self, sampler: vk::Sampler) -> GfxResult<HeapHandle> {
        let index = self.allocate_sampler(sampler)?;
        Ok(self.unique(index))
    }

    /// Retires an index. It becomes allocatable again once
    /// `FRAMES_IN_FLIGHT` frames have advanced.
    pub fn free(&mut self, index: u32) {
        self.indices.free(index);
    }

    /// Applies every pending descriptor write in one
    /// `vkUpdateDescriptorSets` call.
    pub fn flush(&mut self) {
        self.drain_dropped();
        if self.pending.is_empty() {
            return;
        }

        // Collect the infos first so the write structs can borrow stable
        // addresses.
        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = self
            .pending
            .iter()
            .filter_map(|(_, write)| match write {
                DescriptorWrite::Buffer(info) => Some([*info]),
                DescriptorWrite::Image(_) => None,
            })
            .collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = self
            .pending
            .iter()
            .filter_map(|(_, write)| match write {
                DescriptorWrite::Image(info) => Some([*info]),
                DescriptorWrite::Buffer(_) => None,
            })
            .collect();

        let mut writes = Vec::with_capacity(self.pending.len());
        let (mut next_buffer, mut next_image) = (0, 0);
        for (index, write) in &self.pending {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(self.binding)
                .dst_array_element(*index)
                .descriptor_type(self.ty);
            let write = match write {
                DescriptorWrite::Buffer(_) => {
                    next_buffer += 1;
                    base.buffer_info(&buffer_infos[next_buffer - 1])
                }
                DescriptorWrite::Image(_) => {
                    next_image += 1;
                    base.image_info(&image_infos[next_image - 1])
                }
            };
            writes.push(write);
        }

        unsafe { self.device.handle().update_descriptor_sets(&writes, &[]) };

        debug!(
            target: "gfx",
            "Flushed {} descriptor write(s) to {:?} heap",
            self.pending.len(),
            self.ty
        );
        self.pending.clear();
    }

    /// Clears pending writes and restores the full free list.
    pub fn reset(&mut self) {
        self.dropped.lock().unwrap().clear();
        self.pending.clear();
        self.indices.reset();
    }

    /// Advances the retirement clock; call once per frame with the
    /// monotonically increasing frame counter.
    pub fn advance(&mut self, frame: u64) {
        self.drain_dropped();
        self.indices.advance(frame);
    }

    fn unique(&self, index: u32) -> HeapHandle {
        HeapHandle {
            index,
            dropped: self.dropped.clone(),
        }
    }

    fn drain_dropped(&mut self) {
        let mut dropped = self.dropped.lock().unwrap();
        for index in dropped.drain(..) {
            self.indices.free(index);
        }
    }

    fn allocate_index(&mut self) -> GfxResult<u32> {
        self.indices.allocate().ok_or(GfxError::HeapExhausted)
    }
}

impl Drop for ResourceDescriptorHeap {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
            self.device.handle().destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_after_size_allocations() {
        let mut pool = IndexPool::new(4);
        for expected in 0..4 {
            assert_eq!(pool.allocate(), Some(expected));
        }
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_live_set_is_allocated_minus_freed() {
        let mut pool = IndexPool::new(8);
        let mut live: Vec<u32> = (0..5).map(|_| pool.allocate().unwrap()).collect();

        let freed = live.remove(2);
        pool.free(freed);

        // Everything handed out is in range and unique.
        let mut seen = live.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), live.len());
        assert!(live.iter().all(|&i| i < 8));
        assert!(!live.contains(&freed));
    }

    #[test]
    fn test_freed_index_is_held_for_frames_in_flight() {
        let mut pool = IndexPool::new(1);
        let index = pool.allocate().unwrap();
        pool.free(index);

        // Not reusable until FRAMES_IN_FLIGHT frames have advanced.
        for frame in 1..FRAMES_IN_FLIGHT as u64 {
            pool.advance(frame);
            assert_eq!(pool.allocate(), None, "reused too early at frame {}", frame);
        }
        pool.advance(FRAMES_IN_FLIGHT as u64);
        assert_eq!(pool.allocate(), Some(index));
    }

    #[test]
    fn test_reset_restores_full_free_list() {
        let mut pool = IndexPool::new(3);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.reset();
        let mut indices: Vec<u32> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_retirement_preserves_fifo_reclaim_order() {
        let mut pool = IndexPool::new(4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.free(a);
        pool.advance(1);
        pool.free(b);
        pool.advance(FRAMES_IN_FLIGHT as u64);
        // `a` was retired first and comes back first; `b` one frame later.
        assert_eq!(pool.free.last(), Some(&a));
        pool.advance(FRAMES_IN_FLIGHT as u64 + 1);
        assert!(pool.free.contains(&b));
    }
}
