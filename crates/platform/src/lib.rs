//! Windowing and input for the Forge render runtime.
//!
//! This crate wraps winit behind the two collaborators the runtime needs:
//! a [`Window`] (framebuffer size, close flag, focus, fullscreen, VK surface
//! creation) and an [`InputState`] (keyboard, mouse, cursor, scroll).
//!
//! The runtime owns the frame loop, so winit is driven in poll mode: each
//! call to [`Platform::poll_events`] pumps pending OS events into the window
//! and input state and returns immediately.

pub mod input;
pub mod window;

mod pump;

pub use input::{InputEvent, InputState, KeyCode, MouseButton};
pub use pump::Platform;
pub use window::{Surface, Window};
