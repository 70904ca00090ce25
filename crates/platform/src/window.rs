//! Window management using winit.
//!
//! This module provides window state access and Vulkan surface creation.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::{Fullscreen, Window as WinitWindow};

use forge_core::{Error, Result};

/// RAII wrapper for a Vulkan surface.
///
/// This struct owns a `vk::SurfaceKHR` handle and ensures it is properly
/// destroyed when dropped. The surface loader is stored internally to perform
/// cleanup and capability queries.
///
/// # Ownership
/// The surface is destroyed automatically when this struct is dropped.
/// The caller must ensure that the Vulkan instance outlives this surface.
pub struct Surface {
    handle: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Get the raw Vulkan surface handle.
    ///
    /// # Note
    /// The returned handle is valid only as long as this `Surface` instance
    /// exists. Do not store this handle beyond the lifetime of the `Surface`.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Get a reference to the surface loader.
    ///
    /// This is useful for querying surface capabilities, formats, and
    /// present modes.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: the handle was created by ash_window::create_surface from
        // the same instance the loader was built on, and this is the only
        // place it is destroyed.
        unsafe {
            self.surface_loader.destroy_surface(self.handle, None);
        }
        tracing::debug!(target: "gfx", "Vulkan surface destroyed");
    }
}

/// A window wrapper that provides the state queries the frame loop needs and
/// raw handles for Vulkan surface creation.
///
/// The underlying winit window is created and fed by the event pump
/// ([`crate::Platform`]); this type only reads and mutates its state.
pub struct Window {
    window: Arc<WinitWindow>,
    should_close: bool,
    focused: bool,
}

impl Window {
    pub(crate) fn new(window: Arc<WinitWindow>) -> Self {
        Self {
            window,
            should_close: false,
            focused: true,
        }
    }

    /// Get a reference to the underlying winit window.
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    /// Current framebuffer size in pixels.
    ///
    /// Returns `(0, 0)` while the window is minimized; the swapchain code
    /// treats that as "skip recreation".
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Content scale (DPI factor) of the monitor the window is on.
    pub fn content_scale(&self) -> (f32, f32) {
        let scale = self.window.scale_factor() as f32;
        (scale, scale)
    }

    /// Whether the user has requested the window to close.
    #[inline]
    pub fn should_close(&self) -> bool {
        self.should_close
    }

    /// Request the window to close on the next loop iteration.
    pub fn set_should_close(&mut self) {
        self.should_close = true;
    }

    /// Whether the window currently has input focus.
    #[inline]
    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Whether the window is currently fullscreen.
    pub fn is_fullscreen(&self) -> bool {
        self.window.fullscreen().is_some()
    }

    /// Switch between borderless fullscreen and windowed mode.
    pub fn set_fullscreen(&self, fullscreen: bool) {
        let mode = fullscreen.then(|| Fullscreen::Borderless(None));
        self.window.set_fullscreen(mode);
    }

    /// Set the window title.
    pub fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }

    pub(crate) fn on_close_requested(&mut self) {
        self.should_close = true;
    }

    pub(crate) fn on_focus_changed(&mut self, focused: bool) {
        self.focused = focused;
    }

    /// Create a Vulkan surface for this window.
    ///
    /// Returns a RAII [`Surface`] wrapper that destroys the surface when
    /// dropped.
    ///
    /// # Arguments
    /// * `entry` - The Vulkan entry point
    /// * `instance` - The Vulkan instance (must outlive the returned surface)
    ///
    /// # Errors
    /// Returns an error if the native handles cannot be obtained or Vulkan
    /// surface creation fails.
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let display_handle = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;

        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| Error::Window(format!("Failed to get window handle: {}", e)))?;

        // SAFETY: entry and instance are valid, the handles come from a live
        // winit window, and the surface is destroyed in Surface::drop.
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| Error::Window(format!("Failed to create Vulkan surface: {}", e)))?
        };

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        tracing::info!(target: "gfx", "Vulkan surface created");

        Ok(Surface {
            handle,
            surface_loader,
        })
    }
}

/// Get the required Vulkan instance extensions for surface creation on the
/// current platform.
///
/// The returned pointers reference static strings provided by the Vulkan
/// loader and stay valid for the lifetime of the program.
pub fn required_instance_extensions(
    display_handle: raw_window_handle::RawDisplayHandle,
) -> Result<Vec<*const i8>> {
    let extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(|e| Error::Window(format!("Failed to enumerate surface extensions: {}", e)))?;
    Ok(extensions.to_vec())
}
