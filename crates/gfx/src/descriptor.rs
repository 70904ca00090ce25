//! Descriptor set allocation.
//!
//! Pool-list allocator: sets are carved out of the current pool; when it
//! reports fragmentation or exhaustion, the pool is retired and a fresh one
//! (reused from the free list, or newly created) takes over.
//! [`DescriptorSetAllocator::reset`] recycles every retired pool at once.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::GfxResult;

/// Sets per descriptor pool.
const SETS_PER_POOL: u32 = 1024;

/// Descriptor counts per pool, as a factor of the pool's set count.
const DESCRIPTOR_SIZE_FACTORS: &[(vk::DescriptorType, f32)] = &[
    (vk::DescriptorType::SAMPLER, 0.5),
    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
    (vk::DescriptorType::SAMPLED_IMAGE, 4.0),
    (vk::DescriptorType::STORAGE_IMAGE, 1.0),
    (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1.0),
    (vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1.0),
    (vk::DescriptorType::UNIFORM_BUFFER, 2.0),
    (vk::DescriptorType::STORAGE_BUFFER, 2.0),
    (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1.0),
    (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 1.0),
    (vk::DescriptorType::INPUT_ATTACHMENT, 0.5),
];

fn pool_sizes(set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    DESCRIPTOR_SIZE_FACTORS
        .iter()
        .map(|&(ty, factor)| {
            vk::DescriptorPoolSize::default()
                .ty(ty)
                .descriptor_count((set_count as f32 * factor) as u32)
        })
        .collect()
}

/// Pool-list descriptor set allocator.
///
/// Not thread-safe; owned by the render thread.
pub struct DescriptorSetAllocator {
    device: Arc<Device>,
    current_pool: Option<vk::DescriptorPool>,
    used_pools: Vec<vk::DescriptorPool>,
    free_pools: Vec<vk::DescriptorPool>,
}

impl DescriptorSetAllocator {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            current_pool: None,
            used_pools: Vec::new(),
            free_pools: Vec::new(),
        }
    }

    /// Allocates a descriptor set and applies `writes` to it.
    ///
    /// Each write's `dst_set` is patched to the freshly allocated set. On
    /// FRAGMENTED_POOL or OUT_OF_POOL_MEMORY the current pool is retired and
    /// the allocation retried from a fresh pool.
    pub fn allocate(
        &mut self,
        layout: vk::DescriptorSetLayout,
        writes: &mut [vk::WriteDescriptorSet],
    ) -> GfxResult<vk::DescriptorSet> {
        let pool = match self.current_pool {
            Some(pool) => pool,
            None => self.grab_pool()?,
        };

        let set = match self.try_allocate(pool, layout) {
            Ok(set) => set,
            Err(vk::Result::ERROR_FRAGMENTED_POOL | vk::Result::ERROR_OUT_OF_POOL_MEMORY) => {
                let pool = self.grab_pool()?;
                self.try_allocate(pool, layout)?
            }
            Err(e) => return Err(e.into()),
        };

        if !writes.is_empty() {
            for write in writes.iter_mut() {
                write.dst_set = set;
            }
            unsafe { self.device.handle().update_descriptor_sets(writes, &[]) };
        }

        Ok(set)
    }

    /// Resets every retired pool and returns it to the free list.
    ///
    /// # Safety contract
    ///
    /// No set allocated from this allocator may still be in use by the GPU.
    pub fn reset(&mut self) -> GfxResult<()> {
        for &pool in &self.used_pools {
            unsafe {
                self.device
                    .handle()
                    .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
            }
        }
        self.free_pools.append(&mut self.used_pools);
        self.current_pool = None;
        debug!(target: "gfx", "Descriptor set allocator reset ({} pools free)", self.free_pools.len());
        Ok(())
    }

    fn try_allocate(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };
        Ok(sets[0])
    }

    /// Promotes a pool from the free list (or creates one) to current.
    fn grab_pool(&mut self) -> GfxResult<vk::DescriptorPool> {
        let pool = if let Some(pool) = self.free_pools.pop() {
            pool
        } else {
            let sizes = pool_sizes(SETS_PER_POOL);
            let create_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(SETS_PER_POOL)
                .pool_sizes(&sizes);
            let pool = unsafe {
                self.device
                    .handle()
                    .create_descriptor_pool(&create_info, None)?
            };
            debug!(target: "gfx", "Created descriptor pool ({} sets)", SETS_PER_POOL);
            pool
        };
        self.used_pools.push(pool);
        self.current_pool = Some(pool);
        Ok(pool)
    }
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        let device = self.device.handle();
        for &pool in self.used_pools.iter().chain(self.free_pools.iter()) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_scale_with_set_count() {
        let sizes = pool_sizes(SETS_PER_POOL);
        assert_eq!(sizes.len(), DESCRIPTOR_SIZE_FACTORS.len());

        let find = |ty: vk::DescriptorType| {
            sizes
                .iter()
                .find(|size| size.ty == ty)
                .map(|size| size.descriptor_count)
                .unwrap()
        };
        assert_eq!(find(vk::DescriptorType::SAMPLER), 512);
        assert_eq!(find(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 4096);
        assert_eq!(find(vk::DescriptorType::SAMPLED_IMAGE), 4096);
        assert_eq!(find(vk::DescriptorType::STORAGE_IMAGE), 1024);
        assert_eq!(find(vk::DescriptorType::UNIFORM_BUFFER), 2048);
        assert_eq!(find(vk::DescriptorType::STORAGE_BUFFER), 2048);
        assert_eq!(find(vk::DescriptorType::INPUT_ATTACHMENT), 512);
        assert_eq!(find(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC), 1024);
        assert_eq!(find(vk::DescriptorType::STORAGE_TEXEL_BUFFER), 1024);
    }
}
