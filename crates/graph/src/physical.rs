//! Physical realization of transient graph resources.
//!
//! Transient buffers and images are created unbound, grouped by the pure
//! planner's aliasing pass (disjoint live intervals, compatible memory
//! requirements, like kinds only), and bound aliased over one shared
//! allocation per group.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use forge_gfx::allocator::GpuAllocator;
use forge_gfx::GfxResult;

use crate::plan::{alias_groups, Plan};
use crate::{ResourceKind, ResourceNode};

pub(crate) struct PhysicalImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// Transient GPU objects for one compiled graph.
pub(crate) struct PhysicalResources {
    allocator: Arc<GpuAllocator>,
    pub buffers: HashMap<usize, vk::Buffer>,
    pub images: HashMap<usize, PhysicalImage>,
    blocks: Vec<Allocation>,
}

pub(crate) fn realize(
    allocator: &Arc<GpuAllocator>,
    resources: &[ResourceNode],
    plan: &Plan,
) -> GfxResult<PhysicalResources> {
    let device = allocator.device().handle();

    struct Entry {
        is_buffer: bool,
        requirements: vk::MemoryRequirements,
    }

    let mut physical = PhysicalResources {
        allocator: allocator.clone(),
        buffers: HashMap::new(),
        images: HashMap::new(),
        blocks: Vec::new(),
    };
    let mut entries: HashMap<usize, Entry> = HashMap::new();

    // Create unbound objects and gather their memory requirements.
    for &id in plan.live_intervals.keys() {
        match &resources[id].kind {
            ResourceKind::TransientBuffer(desc) => {
                let create_info = vk::BufferCreateInfo::default()
                    .size(desc.size)
                    .usage(desc.usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);
                let buffer = unsafe { device.create_buffer(&create_info, None)? };
                let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
                physical.buffers.insert(id, buffer);
                entries.insert(
                    id,
                    Entry {
                        is_buffer: true,
                        requirements,
                    },
                );
            }
            ResourceKind::TransientImage(desc) => {
                let create_info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(desc.format)
                    .extent(vk::Extent3D {
                        width: desc.extent.width,
                        height: desc.extent.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(desc.usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                let image = unsafe { device.create_image(&create_info, None)? };
                let requirements = unsafe { device.get_image_memory_requirements(image) };
                physical.images.insert(
                    id,
                    PhysicalImage {
                        image,
                        view: vk::ImageView::null(),
                    },
                );
                entries.insert(
                    id,
                    Entry {
                        is_buffer: false,
                        requirements,
                    },
                );
            }
            _ => unreachable!("live_intervals only contains transient resources"),
        }
    }

    // Group by disjoint intervals; only like kinds with overlapping memory
    // type bits may share a block (keeps bufferImageGranularity out of the
    // picture).
    let intervals: Vec<(usize, (usize, usize))> = plan
        .live_intervals
        .iter()
        .map(|(&id, &interval)| (id, interval))
        .collect();
    let groups = alias_groups(&intervals, |a, b| {
        let (a, b) = (&entries[&a], &entries[&b]);
        a.is_buffer == b.is_buffer
            && a.requirements.memory_type_bits & b.requirements.memory_type_bits != 0
    });

    for group in &groups {
        let mut requirements = vk::MemoryRequirements {
            size: 0,
            alignment: 1,
            memory_type_bits: u32::MAX,
        };
        for &id in group {
            let entry = &entries[&id];
            requirements.size = requirements.size.max(entry.requirements.size);
            requirements.alignment = requirements.alignment.max(entry.requirements.alignment);
            requirements.memory_type_bits &= entry.requirements.memory_type_bits;
        }

        let linear = entries[&group[0]].is_buffer;
        let block = allocator.allocate_block(
            "graph transients",
            requirements,
            MemoryLocation::GpuOnly,
            linear,
        )?;

        for &id in group {
            unsafe {
                if let Some(&buffer) = physical.buffers.get(&id) {
                    device.bind_buffer_memory(buffer, block.memory(), block.offset())?;
                } else if let Some(image) = physical.images.get(&id) {
                    device.bind_image_memory(image.image, block.memory(), block.offset())?;
                }
            }
        }
        physical.blocks.push(block);
    }

    // Views require bound memory.
    for (&id, image) in physical.images.iter_mut() {
        let ResourceKind::TransientImage(desc) = &resources[id].kind else {
            continue;
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        image.view = unsafe { device.create_image_view(&view_info, None)? };
    }

    debug!(
        target: "graph",
        "Realized {} transient resource(s) in {} aliased block(s)",
        entries.len(),
        groups.len()
    );

    Ok(physical)
}

impl Drop for PhysicalResources {
    fn drop(&mut self) {
        let device = self.allocator.device().handle();
        unsafe {
            for image in self.images.values() {
                if image.view != vk::ImageView::null() {
                    device.destroy_image_view(image.view, None);
                }
                device.destroy_image(image.image, None);
            }
            for &buffer in self.buffers.values() {
                device.destroy_buffer(buffer, None);
            }
        }
        for block in self.blocks.drain(..) {
            self.allocator.free_block(block);
        }
    }
}
