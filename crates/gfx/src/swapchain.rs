//! Swapchain management.
//!
//! This module handles VkSwapchainKHR creation/recreation, image
//! acquisition, and presentation.
//!
//! # Overview
//!
//! The [`Swapchain`] struct provides a safe abstraction over the Vulkan
//! swapchain:
//! - Recreation with capability clamping and format/present-mode
//!   verification, reusing the old swapchain handle
//! - Acquire/present that report a stale swapchain (out of date or
//!   suboptimal) as the recoverable [`GfxError::SwapchainStale`] value
//! - Image view creation and current-image tracking
//!
//! Recreation is driven by the frame loop: on a stale result it waits for
//! the device to idle, queries the new framebuffer size, and calls
//! [`Swapchain::recreate`].

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{GfxError, GfxResult};

/// Parameters for swapchain (re)creation.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Requested image count, clamped to the surface's limits.
    pub num_images: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            num_images: 3,
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

/// Vulkan swapchain wrapper.
///
/// Not thread-safe; owned and driven by the render thread.
pub struct Swapchain {
    device: Arc<Device>,
    loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    present_queue: vk::Queue,

    swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    num_images: u32,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    present_mode: vk::PresentModeKHR,

    current_image: u32,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Creates an empty swapchain driver; call [`Swapchain::recreate`] to
    /// build the first swapchain.
    pub fn new(
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        surface_loader: ash::khr::surface::Instance,
    ) -> Self {
        let loader = ash::khr::swapchain::Device::new(device.instance(), device.handle());
        let present_queue = device.queue();
        Self {
            device,
            loader,
            surface,
            surface_loader,
            present_queue,
            swapchain: vk::SwapchainKHR::null(),
            extent: vk::Extent2D::default(),
            num_images: 0,
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::FIFO,
            current_image: 0,
            images: Vec::new(),
            image_views: Vec::new(),
        }
    }

    /// Recreates the swapchain for a new extent.
    ///
    /// A zero extent (minimized window) returns without touching the
    /// swapchain. The extent and image count are clamped to the surface
    /// capabilities; the requested format and present mode must be
    /// supported.
    ///
    /// # Errors
    ///
    /// Returns [`GfxError::SurfaceFormatUnsupported`] or
    /// [`GfxError::PresentModeUnsupported`] if the surface cannot satisfy
    /// `desc`, or a Vulkan error if creation fails.
    ///
    /// # Safety contract
    ///
    /// The caller must ensure no commands referencing the old swapchain
    /// images are in flight (the frame loop waits for device idle first).
    pub fn recreate(&mut self, extent: (u32, u32), desc: &SwapchainDesc) -> GfxResult<()> {
        if extent.0 == 0 || extent.1 == 0 {
            return Ok(());
        }

        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(
                    self.device.physical_device(),
                    self.surface,
                )?
        };
        self.extent = clamp_extent(&capabilities, extent.0, extent.1);
        self.num_images = clamp_image_count(&capabilities, desc.num_images);

        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.device.physical_device(), self.surface)?
        };
        if !formats
            .iter()
            .any(|f| f.format == desc.format && f.color_space == desc.color_space)
        {
            return Err(GfxError::SurfaceFormatUnsupported);
        }
        self.format = desc.format;
        self.color_space = desc.color_space;

        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(
                    self.device.physical_device(),
                    self.surface,
                )?
        };
        if !present_modes.contains(&desc.present_mode) {
            return Err(GfxError::PresentModeUnsupported);
        }
        self.present_mode = desc.present_mode;

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(self.num_images)
            .image_format(self.format)
            .image_color_space(self.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        let new_swapchain = unsafe { self.loader.create_swapchain(&create_info, None)? };

        self.destroy_image_views();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = new_swapchain;

        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain)? };
        self.image_views = create_image_views(&self.device, &self.images, self.format)?;

        info!(
            target: "gfx::swapchain",
            "extent: {}x{}, images: {}, format: {:?}, color space: {:?}, present mode: {:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format,
            self.color_space,
            self.present_mode
        );

        Ok(())
    }

    /// Acquires the next swapchain image.
    ///
    /// On success the acquired index becomes the current image. A stale
    /// swapchain (out of date or suboptimal) is reported as
    /// [`GfxError::SwapchainStale`] for the frame loop to recover from.
    pub fn acquire_image(&mut self, image_available: vk::Semaphore) -> GfxResult<()> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, false)) => {
                self.current_image = index;
                Ok(())
            }
            Ok((index, true)) => {
                // Suboptimal still acquired an image; report stale so the
                // loop recreates before the next frame.
                self.current_image = index;
                Err(GfxError::SwapchainStale)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GfxError::SwapchainStale),
            Err(e) => Err(e.into()),
        }
    }

    /// Presents the current image.
    ///
    /// Stale results map to [`GfxError::SwapchainStale`] like
    /// [`Swapchain::acquire_image`].
    pub fn present_image(&mut self, render_finished: vk::Semaphore) -> GfxResult<()> {
        let wait_semaphores = [render_finished];
        let swapchains = [self.swapchain];
        let image_indices = [self.current_image];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(self.present_queue, &present_info) };
        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GfxError::SwapchainStale),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the swapchain extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the number of swapchain images.
    #[inline]
    pub fn num_images(&self) -> u32 {
        self.images.len() as u32
    }

    /// Returns the swapchain image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the color space.
    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    /// Returns the present mode.
    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Returns the most recently acquired image.
    #[inline]
    pub fn current_image(&self) -> vk::Image {
        self.images[self.current_image as usize]
    }

    /// Returns the view of the most recently acquired image.
    #[inline]
    pub fn current_image_view(&self) -> vk::ImageView {
        self.image_views[self.current_image as usize]
    }

    fn destroy_image_views(&mut self) {
        for &image_view in &self.image_views {
            unsafe {
                self.device.handle().destroy_image_view(image_view, None);
            }
        }
        self.image_views.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_image_views();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.loader.destroy_swapchain(self.swapchain, None);
            }
            debug!(
                target: "gfx::swapchain",
                "Swapchain destroyed (was {}x{}, {} images)",
                self.extent.width,
                self.extent.height,
                self.images.len()
            );
        }
    }
}

/// Clamps the requested extent to the surface's limits.
fn clamp_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Clamps the requested image count to `[min_image_count, max_image_count]`.
///
/// A `max_image_count` of zero means the surface imposes no upper bound.
fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let mut count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// Creates color image views for the swapchain images.
fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> GfxResult<Vec<vk::ImageView>> {
    let mut image_views = Vec::with_capacity(images.len());

    for &image in images {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let image_view = unsafe { device.handle().create_image_view(&create_info, None)? };
        image_views.push(image_view);
    }

    debug!(target: "gfx::swapchain", "Created {} image views", image_views.len());
    Ok(image_views)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        min_extent: (u32, u32),
        max_extent: (u32, u32),
        min_images: u32,
        max_images: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            min_image_extent: vk::Extent2D {
                width: min_extent.0,
                height: min_extent.1,
            },
            max_image_extent: vk::Extent2D {
                width: max_extent.0,
                height: max_extent.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_clamp_extent() {
        let caps = capabilities((100, 100), (2000, 2000), 2, 8);

        let extent = clamp_extent(&caps, 3000, 3000);
        assert_eq!((extent.width, extent.height), (2000, 2000));

        let extent = clamp_extent(&caps, 50, 50);
        assert_eq!((extent.width, extent.height), (100, 100));

        let extent = clamp_extent(&caps, 1280, 720);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn test_clamp_image_count() {
        let caps = capabilities((1, 1), (4096, 4096), 2, 4);
        assert_eq!(clamp_image_count(&caps, 3), 3);
        assert_eq!(clamp_image_count(&caps, 1), 2);
        assert_eq!(clamp_image_count(&caps, 8), 4);
    }

    #[test]
    fn test_clamp_image_count_unbounded() {
        // max_image_count == 0 means no upper bound
        let caps = capabilities((1, 1), (4096, 4096), 2, 0);
        assert_eq!(clamp_image_count(&caps, 8), 8);
        assert_eq!(clamp_image_count(&caps, 1), 2);
    }

    #[test]
    fn test_default_desc_matches_contract() {
        let desc = SwapchainDesc::default();
        assert_eq!(desc.num_images, 3);
        assert_eq!(desc.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(desc.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(desc.present_mode, vk::PresentModeKHR::FIFO);
    }
}
