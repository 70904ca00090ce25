//! Poll-mode event pump over winit.
//!
//! winit 0.30 wants to own the application loop through
//! [`winit::application::ApplicationHandler`]; this runtime owns the frame
//! loop instead, so the event loop is driven one batch at a time via
//! `pump_app_events`. The first pump delivers `resumed`, which is where the
//! window is created.

use std::sync::Arc;
use std::time::Duration;

use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::platform::pump_events::EventLoopExtPumpEvents;
use winit::window::{WindowAttributes, WindowId};

use forge_core::{Error, Result};

use crate::input::{InputState, MouseButton};
use crate::window::Window;

/// Owns the winit event loop and the state it feeds.
///
/// Constructed once at engine init; `poll_events` drains pending OS events
/// into the [`Window`] and [`InputState`].
pub struct Platform {
    event_loop: EventLoop<()>,
    state: PlatformState,
}

impl Platform {
    /// Create the event loop and window.
    ///
    /// # Errors
    /// Returns an error if the event loop cannot be created or the window
    /// does not come up on the first event pump.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let mut event_loop = EventLoop::new()
            .map_err(|e| Error::Window(format!("Failed to create event loop: {}", e)))?;

        let mut state = PlatformState {
            attributes: Some(
                WindowAttributes::default()
                    .with_title(title)
                    .with_inner_size(PhysicalSize::new(width, height))
                    .with_resizable(true),
            ),
            window: None,
            input: InputState::new(),
        };

        // Pump until `resumed` has fired and the window exists (usually the
        // very first batch on desktop platforms).
        for _ in 0..16 {
            if state.window.is_some() {
                break;
            }
            let _ = event_loop.pump_app_events(Some(Duration::ZERO), &mut state);
        }
        if state.window.is_none() {
            return Err(Error::Window("Window was not created on startup".into()));
        }

        tracing::info!("Window created: {}x{}", width, height);

        Ok(Self { event_loop, state })
    }

    /// Drain pending OS events into the window and input state.
    ///
    /// Clears per-frame input edges first, so edge queries reflect exactly
    /// the events delivered by this call.
    pub fn poll_events(&mut self) {
        self.state.input.begin_frame();
        let _ = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state);
    }

    /// The window, available after construction.
    #[inline]
    pub fn window(&self) -> &Window {
        self.state.window.as_ref().expect("window exists after init")
    }

    /// Mutable access to the window (close flag).
    #[inline]
    pub fn window_mut(&mut self) -> &mut Window {
        self.state.window.as_mut().expect("window exists after init")
    }

    /// The polled input state.
    #[inline]
    pub fn input(&self) -> &InputState {
        &self.state.input
    }
}

struct PlatformState {
    attributes: Option<WindowAttributes>,
    window: Option<Window>,
    input: InputState,
}

impl ApplicationHandler for PlatformState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let Some(attributes) = self.attributes.take() else {
            return;
        };
        match event_loop.create_window(attributes) {
            Ok(window) => self.window = Some(Window::new(Arc::new(window))),
            Err(e) => tracing::error!("Failed to create window: {}", e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(window) = self.window.as_mut() else {
            return;
        };
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("Close requested");
                window.on_close_requested();
            }
            WindowEvent::Resized(size) => {
                tracing::debug!("Window resized to {}x{}", size.width, size.height);
            }
            WindowEvent::Focused(focused) => {
                window.on_focus_changed(focused);
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    self.input
                        .handle_key(key, event.state == ElementState::Pressed);
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                if let Some(button) = MouseButton::from_winit(button) {
                    self.input
                        .handle_mouse_button(button, state == ElementState::Pressed);
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.input
                    .handle_cursor(position.x as f32, position.y as f32);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let (dx, dy) = match delta {
                    MouseScrollDelta::LineDelta(x, y) => (x, y),
                    MouseScrollDelta::PixelDelta(pos) => (pos.x as f32, pos.y as f32),
                };
                self.input.handle_scroll(dx, dy);
            }
            _ => {}
        }
    }
}
