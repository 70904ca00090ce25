//! Content-addressed object caches.
//!
//! A generic map-with-factory [`Cache`] plus the two layout caches built on
//! it. Keys are canonicalized before hashing so binding lists that differ
//! only in declaration order, or in which shader stage contributed a
//! binding, dedup to the same object.
//!
//! Caches are not thread-safe; the render thread owns them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::GfxResult;

/// Generic content-addressed cache: a map whose misses are filled by a
/// factory.
pub struct Cache<K, V> {
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the cached value for `key`, invoking `create` on a miss.
    pub fn get_or_create<E>(
        &mut self,
        key: &K,
        create: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<&V, E> {
        if !self.entries.contains_key(key) {
            let value = create(key)?;
            self.entries.insert(key.clone(), value);
        }
        Ok(self.entries.get(key).expect("inserted above"))
    }

    /// Returns the cached value for `key` without creating it.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the cached values (used by owners for cleanup).
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

impl<K: Eq + Hash + Clone, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// One canonicalized descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    fn to_vk(self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.ty)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

/// Canonicalized descriptor-set-layout key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutKey {
    pub flags: vk::DescriptorSetLayoutCreateFlags,
    pub bindings: Vec<LayoutBinding>,
}

/// Merges duplicate bindings (OR-ing stage flags) and sorts by binding
/// index, so equivalent layouts hash identically.
pub fn canonicalize_bindings(bindings: &mut Vec<LayoutBinding>) {
    bindings.sort_by_key(|b| b.binding);
    bindings.dedup_by(|next, kept| {
        if kept.binding == next.binding {
            debug_assert_eq!(kept.ty, next.ty);
            kept.stages |= next.stages;
            kept.count = kept.count.max(next.count);
            true
        } else {
            false
        }
    });
}

/// Cache of descriptor set layouts keyed by their canonicalized bindings.
pub struct DescriptorSetLayoutCache {
    device: Arc<Device>,
    cache: Cache<DescriptorSetLayoutKey, vk::DescriptorSetLayout>,
}

impl DescriptorSetLayoutCache {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            cache: Cache::new(),
        }
    }

    /// Returns the layout for `key`, creating it on first use.
    ///
    /// The key's bindings are canonicalized before the lookup.
    pub fn get(&mut self, mut key: DescriptorSetLayoutKey) -> GfxResult<vk::DescriptorSetLayout> {
        canonicalize_bindings(&mut key.bindings);
        let device = &self.device;
        let layout = self.cache.get_or_create(&key, |key| {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> =
                key.bindings.iter().map(|b| b.to_vk()).collect();
            let create_info = vk::DescriptorSetLayoutCreateInfo::default()
                .flags(key.flags)
                .bindings(&bindings);
            let layout = unsafe {
                device
                    .handle()
                    .create_descriptor_set_layout(&create_info, None)?
            };
            debug!(
                target: "gfx",
                "Created descriptor set layout ({} bindings)",
                key.bindings.len()
            );
            Ok::<_, crate::GfxError>(layout)
        })?;
        Ok(*layout)
    }
}

impl Drop for DescriptorSetLayoutCache {
    fn drop(&mut self) {
        for &layout in self.cache.values() {
            unsafe {
                self.device
                    .handle()
                    .destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

/// One push-constant range, canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    pub fn to_vk(self) -> vk::PushConstantRange {
        vk::PushConstantRange::default()
            .stage_flags(self.stages)
            .offset(self.offset)
            .size(self.size)
    }
}

/// Canonicalized pipeline-layout key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PipelineLayoutKey {
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

/// Cache of pipeline layouts keyed by set layouts + push constant ranges.
pub struct PipelineLayoutCache {
    device: Arc<Device>,
    cache: Cache<PipelineLayoutKey, vk::PipelineLayout>,
}

impl PipelineLayoutCache {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            cache: Cache::new(),
        }
    }

    /// Returns the pipeline layout for `key`, creating it on first use.
    pub fn get(&mut self, key: PipelineLayoutKey) -> GfxResult<vk::PipelineLayout> {
        let device = &self.device;
        let layout = self.cache.get_or_create(&key, |key| {
            let ranges: Vec<vk::PushConstantRange> = key
                .push_constant_ranges
                .iter()
                .map(|range| range.to_vk())
                .collect();
            let create_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&key.set_layouts)
                .push_constant_ranges(&ranges);
            let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };
            debug!(
                target: "gfx",
                "Created pipeline layout ({} sets, {} push constant ranges)",
                key.set_layouts.len(),
                key.push_constant_ranges.len()
            );
            Ok::<_, crate::GfxError>(layout)
        })?;
        Ok(*layout)
    }
}

impl Drop for PipelineLayoutCache {
    fn drop(&mut self) {
        for &layout in self.cache.values() {
            unsafe {
                self.device.handle().destroy_pipeline_layout(layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_cache_returns_same_value_for_equal_keys() {
        let mut cache: Cache<u32, u32> = Cache::new();
        let mut calls = 0;
        for _ in 0..3 {
            let value = *cache
                .get_or_create(&7, |&k| {
                    calls += 1;
                    Ok::<_, Infallible>(k * 2)
                })
                .unwrap();
            assert_eq!(value, 14);
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_distinct_keys_create_distinct_entries() {
        let mut cache: Cache<u32, u32> = Cache::new();
        for key in 0..4u32 {
            cache
                .get_or_create(&key, |&k| Ok::<_, Infallible>(k))
                .unwrap();
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_cache_error_does_not_insert() {
        let mut cache: Cache<u32, u32> = Cache::new();
        let result: Result<&u32, &str> = cache.get_or_create(&1, |_| Err("nope"));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    fn binding(index: u32, stages: vk::ShaderStageFlags) -> LayoutBinding {
        LayoutBinding {
            binding: index,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stages,
        }
    }

    #[test]
    fn test_canonicalize_sorts_by_binding() {
        let mut bindings = vec![
            binding(2, vk::ShaderStageFlags::VERTEX),
            binding(0, vk::ShaderStageFlags::VERTEX),
            binding(1, vk::ShaderStageFlags::VERTEX),
        ];
        canonicalize_bindings(&mut bindings);
        let order: Vec<u32> = bindings.iter().map(|b| b.binding).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_canonicalize_merges_stage_flags() {
        // The same binding seen from two stages collapses to one entry with
        // OR-ed stages, so the key is stage-contribution independent.
        let mut from_vertex_first = vec![
            binding(0, vk::ShaderStageFlags::VERTEX),
            binding(0, vk::ShaderStageFlags::FRAGMENT),
        ];
        let mut from_fragment_first = vec![
            binding(0, vk::ShaderStageFlags::FRAGMENT),
            binding(0, vk::ShaderStageFlags::VERTEX),
        ];
        canonicalize_bindings(&mut from_vertex_first);
        canonicalize_bindings(&mut from_fragment_first);

        assert_eq!(from_vertex_first, from_fragment_first);
        assert_eq!(from_vertex_first.len(), 1);
        assert_eq!(
            from_vertex_first[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_canonicalized_keys_hash_identically() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut a = DescriptorSetLayoutKey {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![
                binding(1, vk::ShaderStageFlags::FRAGMENT),
                binding(0, vk::ShaderStageFlags::VERTEX),
            ],
        };
        let mut b = DescriptorSetLayoutKey {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: vec![
                binding(0, vk::ShaderStageFlags::VERTEX),
                binding(1, vk::ShaderStageFlags::FRAGMENT),
            ],
        };
        canonicalize_bindings(&mut a.bindings);
        canonicalize_bindings(&mut b.bindings);

        let hash = |key: &DescriptorSetLayoutKey| {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));
    }
}
