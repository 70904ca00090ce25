//! Keyboard and mouse state.
//!
//! Input is polled: the event pump feeds OS events in, consumers query the
//! resulting state each frame. Every key and mouse button runs through a
//! small per-button state machine (`JustPressed → Held → JustReleased`),
//! which is what makes edge queries ("was this pressed *this* frame")
//! cheap and repeat-safe. The raw events of a frame are additionally kept
//! in an ordered queue for consumers that want the event stream itself
//! (UI layers, text input).

use std::collections::HashMap;

pub use winit::keyboard::KeyCode;

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

impl MouseButton {
    /// Maps a winit button; exotic extra buttons are dropped.
    pub fn from_winit(button: winit::event::MouseButton) -> Option<Self> {
        match button {
            winit::event::MouseButton::Left => Some(Self::Left),
            winit::event::MouseButton::Right => Some(Self::Right),
            winit::event::MouseButton::Middle => Some(Self::Middle),
            winit::event::MouseButton::Back => Some(Self::Back),
            winit::event::MouseButton::Forward => Some(Self::Forward),
            winit::event::MouseButton::Other(_) => None,
        }
    }
}

/// One input event, in delivery order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Key { key: KeyCode, pressed: bool },
    MouseButton { button: MouseButton, pressed: bool },
    CursorMoved { x: f32, y: f32 },
    Scroll { dx: f32, dy: f32 },
}

/// Lifecycle of a pressed button across frames.
///
/// Buttons that are up have no entry at all; `JustReleased` entries are
/// evicted at the next frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonState {
    JustPressed,
    Held,
    JustReleased,
}

impl ButtonState {
    fn is_down(self) -> bool {
        matches!(self, Self::JustPressed | Self::Held)
    }

    /// The state one frame later, `None` meaning the entry is dropped.
    fn settled(self) -> Option<Self> {
        match self {
            Self::JustPressed | Self::Held => Some(Self::Held),
            Self::JustReleased => None,
        }
    }
}

/// Polled keyboard/mouse state with per-frame edges and an event queue.
#[derive(Debug, Default)]
pub struct InputState {
    keys: HashMap<KeyCode, ButtonState>,
    buttons: HashMap<MouseButton, ButtonState>,

    cursor: (f32, f32),
    /// Cursor position snapshotted at the last frame boundary.
    frame_start_cursor: (f32, f32),
    /// Scroll accumulated over the current frame.
    scroll: (f32, f32),

    events: Vec<InputEvent>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances to the next frame: settles button states, snapshots the
    /// cursor for delta queries, and clears the event queue and scroll
    /// accumulator.
    pub fn begin_frame(&mut self) {
        self.keys.retain(|_, state| match state.settled() {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        });
        self.buttons.retain(|_, state| match state.settled() {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        });
        self.frame_start_cursor = self.cursor;
        self.scroll = (0.0, 0.0);
        self.events.clear();
    }

    /// Feeds a key transition. OS key repeats (a press while already down)
    /// do not produce a new edge or event.
    pub fn handle_key(&mut self, key: KeyCode, pressed: bool) {
        if transition(&mut self.keys, key, pressed) {
            self.events.push(InputEvent::Key { key, pressed });
        }
    }

    /// Feeds a mouse button transition.
    pub fn handle_mouse_button(&mut self, button: MouseButton, pressed: bool) {
        if transition(&mut self.buttons, button, pressed) {
            self.events.push(InputEvent::MouseButton { button, pressed });
        }
    }

    /// Feeds a cursor move in window coordinates.
    pub fn handle_cursor(&mut self, x: f32, y: f32) {
        self.cursor = (x, y);
        self.events.push(InputEvent::CursorMoved { x, y });
    }

    /// Feeds a scroll step; multiple steps within one frame accumulate.
    pub fn handle_scroll(&mut self, dx: f32, dy: f32) {
        self.scroll.0 += dx;
        self.scroll.1 += dy;
        self.events.push(InputEvent::Scroll { dx, dy });
    }

    /// Whether a key is currently down.
    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.keys.get(&key).is_some_and(|state| state.is_down())
    }

    /// Whether a key went down this frame.
    pub fn is_key_just_pressed(&self, key: KeyCode) -> bool {
        self.keys.get(&key) == Some(&ButtonState::JustPressed)
    }

    /// Whether a key came up this frame.
    pub fn is_key_just_released(&self, key: KeyCode) -> bool {
        self.keys.get(&key) == Some(&ButtonState::JustReleased)
    }

    /// Whether a mouse button is currently down.
    pub fn is_mouse_button_pressed(&self, button: MouseButton) -> bool {
        self.buttons
            .get(&button)
            .is_some_and(|state| state.is_down())
    }

    /// Whether a mouse button went down this frame.
    pub fn is_mouse_button_just_pressed(&self, button: MouseButton) -> bool {
        self.buttons.get(&button) == Some(&ButtonState::JustPressed)
    }

    /// Current cursor position in window coordinates.
    pub fn cursor_pos(&self) -> (f32, f32) {
        self.cursor
    }

    /// Cursor movement since the frame started.
    pub fn cursor_delta(&self) -> (f32, f32) {
        (
            self.cursor.0 - self.frame_start_cursor.0,
            self.cursor.1 - self.frame_start_cursor.1,
        )
    }

    /// Scroll accumulated this frame.
    pub fn scroll_delta(&self) -> (f32, f32) {
        self.scroll
    }

    /// The frame's events in delivery order.
    pub fn events(&self) -> &[InputEvent] {
        &self.events
    }
}

/// Applies a transition to a button map; returns whether it was a real
/// edge (not an OS repeat or a release of a button that was never down).
fn transition<B: Copy + Eq + std::hash::Hash>(
    map: &mut HashMap<B, ButtonState>,
    button: B,
    pressed: bool,
) -> bool {
    let current = map.get(&button).copied();
    let down = current.is_some_and(|state| state.is_down());
    if pressed {
        if down {
            return false;
        }
        map.insert(button, ButtonState::JustPressed);
        true
    } else {
        if !down {
            return false;
        }
        map.insert(button, ButtonState::JustReleased);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_lifecycle_across_frames() {
        let mut input = InputState::new();

        input.handle_key(KeyCode::Space, true);
        assert!(input.is_key_pressed(KeyCode::Space));
        assert!(input.is_key_just_pressed(KeyCode::Space));

        input.begin_frame();
        assert!(input.is_key_pressed(KeyCode::Space));
        assert!(!input.is_key_just_pressed(KeyCode::Space));

        input.handle_key(KeyCode::Space, false);
        assert!(!input.is_key_pressed(KeyCode::Space));
        assert!(input.is_key_just_released(KeyCode::Space));

        input.begin_frame();
        assert!(!input.is_key_just_released(KeyCode::Space));
    }

    #[test]
    fn test_os_repeat_is_not_an_edge() {
        let mut input = InputState::new();

        input.handle_key(KeyCode::KeyW, true);
        input.begin_frame();
        input.handle_key(KeyCode::KeyW, true);
        assert!(input.is_key_pressed(KeyCode::KeyW));
        assert!(!input.is_key_just_pressed(KeyCode::KeyW));
        assert!(input.events().is_empty());
    }

    #[test]
    fn test_spurious_release_is_ignored() {
        let mut input = InputState::new();
        input.handle_key(KeyCode::KeyA, false);
        assert!(input.events().is_empty());
        assert!(!input.is_key_just_released(KeyCode::KeyA));
    }

    #[test]
    fn test_cursor_delta_is_per_frame() {
        let mut input = InputState::new();

        input.handle_cursor(10.0, 20.0);
        input.begin_frame();
        input.handle_cursor(12.0, 19.0);
        input.handle_cursor(15.0, 18.0);
        assert_eq!(input.cursor_pos(), (15.0, 18.0));
        assert_eq!(input.cursor_delta(), (5.0, -2.0));

        input.begin_frame();
        assert_eq!(input.cursor_delta(), (0.0, 0.0));
    }

    #[test]
    fn test_scroll_accumulates_within_a_frame() {
        let mut input = InputState::new();
        input.handle_scroll(0.0, 1.0);
        input.handle_scroll(0.0, 2.0);
        assert_eq!(input.scroll_delta(), (0.0, 3.0));
        input.begin_frame();
        assert_eq!(input.scroll_delta(), (0.0, 0.0));
    }

    #[test]
    fn test_mouse_button_edges() {
        let mut input = InputState::new();

        input.handle_mouse_button(MouseButton::Left, true);
        assert!(input.is_mouse_button_pressed(MouseButton::Left));
        assert!(input.is_mouse_button_just_pressed(MouseButton::Left));

        input.handle_mouse_button(MouseButton::Left, false);
        assert!(!input.is_mouse_button_pressed(MouseButton::Left));
    }

    #[test]
    fn test_event_queue_preserves_order() {
        let mut input = InputState::new();
        input.handle_key(KeyCode::KeyA, true);
        input.handle_scroll(1.0, 0.0);
        input.handle_key(KeyCode::KeyA, false);

        assert_eq!(
            input.events(),
            &[
                InputEvent::Key {
                    key: KeyCode::KeyA,
                    pressed: true
                },
                InputEvent::Scroll { dx: 1.0, dy: 0.0 },
                InputEvent::Key {
                    key: KeyCode::KeyA,
                    pressed: false
                },
            ]
        );
    }

    #[test]
    fn test_from_winit_drops_exotic_buttons() {
        assert_eq!(
            MouseButton::from_winit(winit::event::MouseButton::Back),
            Some(MouseButton::Back)
        );
        assert_eq!(MouseButton::from_winit(winit::event::MouseButton::Other(7)), None);
    }
}
