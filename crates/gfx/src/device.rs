//! Vulkan logical device and queue management.
//!
//! This module handles physical device selection, device extension
//! negotiation, queue family selection, and VkDevice creation.
//!
//! # Overview
//!
//! The [`Device`] struct provides a safe abstraction over the Vulkan logical
//! device, including:
//! - Physical device selection (first enumerated device)
//! - Required extension verification (swapchain) and desired extension
//!   recording (calibrated timestamps, memory budget)
//! - A single main queue from the lowest-index family supporting
//!   graphics, compute, and present
//! - The Vulkan 1.1/1.2/1.3 feature chain for bindless descriptor indexing,
//!   buffer device addresses, synchronization2, and dynamic rendering

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use forge_platform::Surface;

use crate::error::{GfxError, GfxResult};
use crate::instance::Instance;

/// Device extensions that must be present.
const REQUIRED_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

/// Device extensions that are enabled when present.
const DESIRED_EXTENSIONS: &[&CStr] = &[
    ash::ext::calibrated_timestamps::NAME,
    ash::ext::memory_budget::NAME,
];

/// Vulkan logical device wrapper.
///
/// Shared across the graphics services via `Arc`; each service keeps its own
/// reference so the device outlives everything created from it. The device
/// is destroyed when the last reference drops.
pub struct Device {
    /// Vulkan logical device handle.
    device: ash::Device,
    /// Instance handle clone, kept for allocator construction.
    instance: ash::Instance,
    /// Physical device handle.
    physical_device: vk::PhysicalDevice,
    /// Physical device properties (limits, timestamp period).
    properties: vk::PhysicalDeviceProperties,
    /// The main graphics+compute+present queue.
    queue: vk::Queue,
    /// Queue family index of the main queue.
    queue_family_index: u32,
    /// Names of the device extensions that were enabled.
    enabled_extensions: Vec<CString>,
}

impl Device {
    /// Creates a new logical device.
    ///
    /// # Errors
    ///
    /// Returns an error if no physical device is present, a required
    /// extension is missing, no compatible queue family exists, or device
    /// creation fails.
    pub fn new(instance: &Instance, surface: &Surface) -> GfxResult<Arc<Self>> {
        let physical_device = pick_physical_device(instance)?;
        let enabled_extensions = negotiate_extensions(instance, physical_device)?;
        let queue_family_index = pick_queue_family(instance, physical_device, surface)?;

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let queue_create_infos = [queue_create_info];

        let mut features_1_1 =
            vk::PhysicalDeviceVulkan11Features::default().shader_draw_parameters(true);

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .draw_indirect_count(true)
            .descriptor_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_partially_bound(true)
            .runtime_descriptor_array(true)
            .host_query_reset(true);

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let extension_ptrs: Vec<*const i8> =
            enabled_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features_1_1)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device, &create_info, None)?
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let properties = unsafe {
            instance
                .handle()
                .get_physical_device_properties(physical_device)
        };

        info!(
            target: "gfx",
            "Logical device created with {} extension(s), queue family {}",
            enabled_extensions.len(),
            queue_family_index
        );

        Ok(Arc::new(Self {
            device,
            instance: instance.handle().clone(),
            physical_device,
            properties,
            queue,
            queue_family_index,
            enabled_extensions,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the instance handle the device was created from.
    #[inline]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the main queue handle.
    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Returns the queue family index of the main queue.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Nanoseconds per timestamp tick, for the GPU profiler.
    #[inline]
    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    /// Whether the given device extension was enabled at creation.
    pub fn is_extension_enabled(&self, name: &CStr) -> bool {
        self.enabled_extensions.iter().any(|ext| ext.as_c_str() == name)
    }

    /// Waits for the device to become idle.
    ///
    /// Blocks until all outstanding operations on all queues have completed.
    /// Called on teardown and before swapchain recreation.
    pub fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!(target: "gfx", "wait_idle failed during device drop: {:?}", e);
            }
            self.device.destroy_device(None);
        }
        info!(target: "gfx", "Logical device destroyed");
    }
}

/// Picks the first enumerated physical device, logging the alternatives.
fn pick_physical_device(instance: &Instance) -> GfxResult<vk::PhysicalDevice> {
    let physical_devices = unsafe { instance.handle().enumerate_physical_devices()? };
    if physical_devices.is_empty() {
        return Err(GfxError::NoPhysicalDevice);
    }

    info!(target: "gfx", "Supported devices:");
    for &physical_device in &physical_devices {
        let properties = unsafe {
            instance
                .handle()
                .get_physical_device_properties(physical_device)
        };
        let name = properties
            .device_name_as_c_str()
            .unwrap_or(c"(unknown)")
            .to_string_lossy();
        info!(target: "gfx", "   {}", name);
    }

    let selected = physical_devices[0];
    let properties = unsafe { instance.handle().get_physical_device_properties(selected) };
    info!(
        target: "gfx",
        "Selected device {}",
        properties
            .device_name_as_c_str()
            .unwrap_or(c"(unknown)")
            .to_string_lossy()
    );
    Ok(selected)
}

/// Verifies required extensions and records desired ones that are present.
fn negotiate_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> GfxResult<Vec<CString>> {
    let available = unsafe {
        instance
            .handle()
            .enumerate_device_extension_properties(physical_device)?
    };
    let is_supported = |name: &CStr| {
        available.iter().any(|properties| {
            properties
                .extension_name_as_c_str()
                .is_ok_and(|ext| ext == name)
        })
    };

    let mut enabled = Vec::new();
    for &required in REQUIRED_EXTENSIONS {
        if !is_supported(required) {
            return Err(GfxError::MissingRequiredExtension(
                required.to_string_lossy().into_owned(),
            ));
        }
        enabled.push(required.to_owned());
    }
    for &desired in DESIRED_EXTENSIONS {
        if is_supported(desired) {
            enabled.push(desired.to_owned());
        }
    }

    info!(target: "gfx", "Enabled extensions:");
    for extension in &enabled {
        info!(target: "gfx", "   {}", extension.to_string_lossy());
    }
    Ok(enabled)
}

/// Picks the lowest-index queue family with graphics, compute, and present
/// support.
fn pick_queue_family(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: &Surface,
) -> GfxResult<u32> {
    let families = unsafe {
        instance
            .handle()
            .get_physical_device_queue_family_properties(physical_device)
    };

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        if !family.queue_flags.contains(flags) {
            continue;
        }
        let present = unsafe {
            surface.loader().get_physical_device_surface_support(
                physical_device,
                index,
                surface.handle(),
            )?
        };
        if present {
            debug!(target: "gfx", "Using queue family {} ({:?})", index, family.queue_flags);
            return Ok(index);
        }
    }

    Err(GfxError::NoCompatibleQueueFamily)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_extensions_contain_swapchain() {
        assert!(REQUIRED_EXTENSIONS.contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    fn test_desired_extensions_are_optional_set() {
        assert!(DESIRED_EXTENSIONS.contains(&ash::ext::calibrated_timestamps::NAME));
        assert!(DESIRED_EXTENSIONS.contains(&ash::ext::memory_budget::NAME));
        // Desired extensions must never overlap the required set.
        for ext in DESIRED_EXTENSIONS {
            assert!(!REQUIRED_EXTENSIONS.contains(ext));
        }
    }
}
