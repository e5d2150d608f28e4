//! Control input relayed from authorized viewers to the host.
//!
//! The session only decodes and gates input; delivering it to the OS is
//! the job of an [`InputSink`] supplied by the process bootstrap.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::TesseraError;

// ── Mouse ────────────────────────────────────────────────────────

/// Pointer event in absolute virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    pub kind: MouseEventKind,
    pub button: MouseButton,
    /// Wheel delta for [`MouseEventKind::Scroll`].
    pub scroll_delta: i16,
}

impl MouseEvent {
    pub fn move_to(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Move,
            button: MouseButton::None,
            scroll_delta: 0,
        }
    }

    pub fn press(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            kind: MouseEventKind::Press,
            button,
            ..Self::move_to(x, y)
        }
    }

    pub fn release(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            kind: MouseEventKind::Release,
            button,
            ..Self::move_to(x, y)
        }
    }

    pub fn scroll(x: i32, y: i32, delta: i16) -> Self {
        Self {
            kind: MouseEventKind::Scroll,
            scroll_delta: delta,
            ..Self::move_to(x, y)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MouseEventKind {
    Move,
    Press,
    Release,
    Scroll,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MouseButton {
    None,
    Left,
    Right,
    Middle,
}

// ── Keyboard ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KeyEvent {
    /// Platform key code.
    pub code: u32,
    pub action: KeyAction,
    /// Modifier bits, see [`key_modifiers`].
    pub modifiers: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

pub mod key_modifiers {
    pub const NONE: u8 = 0x00;
    pub const SHIFT: u8 = 0x01;
    pub const CTRL: u8 = 0x02;
    pub const ALT: u8 = 0x04;
    pub const META: u8 = 0x08;
}

impl KeyEvent {
    pub fn press(code: u32, modifiers: u8) -> Self {
        Self {
            code,
            action: KeyAction::Press,
            modifiers,
        }
    }

    pub fn release(code: u32, modifiers: u8) -> Self {
        Self {
            code,
            action: KeyAction::Release,
            modifiers,
        }
    }

    pub fn has_modifier(&self, modifier: u8) -> bool {
        self.modifiers & modifier != 0
    }
}

// ── InputSink ────────────────────────────────────────────────────

/// Receives control input from viewers holding full control.
pub trait InputSink: Send + Sync {
    fn inject_mouse(&self, event: &MouseEvent) -> Result<(), TesseraError>;
    fn inject_key(&self, event: &KeyEvent) -> Result<(), TesseraError>;
}

/// Sink that only traces what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInputSink;

impl InputSink for LogInputSink {
    fn inject_mouse(&self, event: &MouseEvent) -> Result<(), TesseraError> {
        trace!(?event, "mouse input");
        Ok(())
    }

    fn inject_key(&self, event: &KeyEvent) -> Result<(), TesseraError> {
        trace!(?event, "key input");
        Ok(())
    }
}
