//! Synthetic displays.
//!
//! Platform pixel grabbing is out of scope, so every configured display
//! is an in-memory framebuffer showing a test pattern: a gradient
//! background with a block bouncing across it and the pointer following
//! the block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tessera_core::{DisplayCapture, DisplayFactory, MemoryDisplay, MemoryDisplayHandle, Rect};
use tracing::debug;

use crate::config::DisplayConfig;

const BLOCK: u32 = 48;
const BLOCK_COLOR: u32 = 0xFFF0F0F0;

/// Background colour at `(x, y)` of a `width × height` display.
pub fn gradient(x: u32, y: u32, width: u32, height: u32) -> u32 {
    let r = x * 255 / width.max(1);
    let g = y * 255 / height.max(1);
    0xFF000000 | (r << 16) | (g << 8) | 0x40
}

/// Animated test pattern on a [`MemoryDisplay`].
pub struct TestPattern {
    handle: MemoryDisplayHandle,
    bounds: Rect,
    block: (i32, i32),
    velocity: (i32, i32),
}

impl TestPattern {
    /// Build the display and a factory that opens capture handles onto it.
    pub fn new(config: &DisplayConfig) -> (Self, DisplayFactory) {
        let bounds = Rect::new(config.x, config.y, config.width.max(1), config.height.max(1));
        let (_, handle) = MemoryDisplay::new(config.name.clone(), bounds, 0);
        handle.paint(Rect::new(0, 0, bounds.width, bounds.height), |x, y| {
            gradient(x, y, bounds.width, bounds.height)
        });

        let name = config.name.clone();
        let framebuffer = handle.clone();
        let factory: DisplayFactory = Box::new(move || {
            Ok(Box::new(framebuffer.open(name.clone())) as Box<dyn DisplayCapture>)
        });

        let pattern = Self {
            handle,
            bounds,
            block: (0, 0),
            velocity: (7, 5),
        };
        pattern.draw_block();
        (pattern, factory)
    }

    pub fn handle(&self) -> &MemoryDisplayHandle {
        &self.handle
    }

    fn block_rect(&self) -> Rect {
        Rect::new(self.block.0, self.block.1, BLOCK, BLOCK)
    }

    fn draw_block(&self) {
        self.handle.fill_rect(self.block_rect(), BLOCK_COLOR);
        let (cx, cy) = (
            self.bounds.x + self.block.0 + BLOCK as i32 / 2,
            self.bounds.y + self.block.1 + BLOCK as i32 / 2,
        );
        self.handle.move_cursor(Some((cx, cy)));
    }

    /// Advance the animation by one frame.
    pub fn step(&mut self) {
        let (width, height) = (self.bounds.width, self.bounds.height);
        self.handle
            .paint(self.block_rect(), |x, y| gradient(x, y, width, height));

        let max_x = (width as i32 - BLOCK as i32).max(0);
        let max_y = (height as i32 - BLOCK as i32).max(0);
        let (mut x, mut y) = (self.block.0 + self.velocity.0, self.block.1 + self.velocity.1);
        if !(0..=max_x).contains(&x) {
            self.velocity.0 = -self.velocity.0;
            x = x.clamp(0, max_x);
        }
        if !(0..=max_y).contains(&y) {
            self.velocity.1 = -self.velocity.1;
            y = y.clamp(0, max_y);
        }
        self.block = (x, y);
        self.draw_block();
    }

    /// Step every `period` until `running` clears.
    pub async fn animate(mut self, period: Duration, running: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.step();
        }
        debug!("test pattern stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────
