//! Display capture collaborator.
//!
//! The monitor never talks to the platform directly. It drives a
//! [`DisplayCapture`] implementation, which hides whatever grabs pixels
//! (a desktop duplication API, an X11 shm segment, a VNC upstream...).
//!
//! Pixels are packed `0xAARRGGBB` values, one `u32` per pixel, rows
//! tightly packed.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::TesseraError;
use crate::geometry::Rect;

// ── DisplayCapture ───────────────────────────────────────────────

/// A single sampled display.
pub trait DisplayCapture: Send {
    /// Position (in virtual-desktop coordinates) and size of the display.
    fn screen_bounds(&mut self) -> Rect;

    /// Copy the display-relative rectangle `rect` into `buf`
    /// (`rect.area()` pixels, row-major).
    fn rgb_pixels(&mut self, rect: Rect, buf: &mut [u32]) -> Result<(), TesseraError>;

    /// Copy the whole display.
    fn rgb_screen(&mut self) -> Result<Vec<u32>, TesseraError>;

    /// Invalidate any cached frame; called once before each capture pass.
    fn mark_cache_dirty(&mut self);

    /// Absolute pointer position, or `None` when the pointer is on another display.
    fn cursor_position(&mut self) -> Option<(i32, i32)>;

    /// Human-readable name used in logs.
    fn name(&self) -> String;
}

// ── MemoryDisplay ────────────────────────────────────────────────

#[derive(Debug)]
struct Framebuffer {
    bounds: Rect,
    pixels: Vec<u32>,
    cursor: Option<(i32, i32)>,
    failures_pending: u32,
    dirty_marks: u64,
}

/// A display backed by an in-memory framebuffer.
///
/// Mutate it through a [`MemoryDisplayHandle`] while a monitor samples it.
pub struct MemoryDisplay {
    name: String,
    fb: Arc<Mutex<Framebuffer>>,
}

/// Cloneable handle for drawing into a [`MemoryDisplay`].
#[derive(Clone)]
pub struct MemoryDisplayHandle {
    fb: Arc<Mutex<Framebuffer>>,
}

impl MemoryDisplay {
    /// A `width × height` display at virtual-desktop origin `(x, y)`, filled with `fill`.
    pub fn new(name: impl Into<String>, bounds: Rect, fill: u32) -> (Self, MemoryDisplayHandle) {
        let fb = Arc::new(Mutex::new(Framebuffer {
            bounds,
            pixels: vec![fill; bounds.area()],
            cursor: None,
            failures_pending: 0,
            dirty_marks: 0,
        }));
        let handle = MemoryDisplayHandle { fb: Arc::clone(&fb) };
        (
            Self {
                name: name.into(),
                fb,
            },
            handle,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Framebuffer> {
        self.fb.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DisplayCapture for MemoryDisplay {
    fn screen_bounds(&mut self) -> Rect {
        self.lock().bounds
    }

    fn rgb_pixels(&mut self, rect: Rect, buf: &mut [u32]) -> Result<(), TesseraError> {
        let mut fb = self.lock();
        if fb.failures_pending > 0 {
            fb.failures_pending -= 1;
            return Err(TesseraError::Capture(format!("{}: injected failure", self.name)));
        }
        let width = fb.bounds.width as usize;
        let (x, y) = (rect.x.max(0) as usize, rect.y.max(0) as usize);
        let (w, h) = (rect.width as usize, rect.height as usize);
        if x + w > width || y + h > fb.bounds.height as usize || buf.len() < w * h {
            return Err(TesseraError::Capture(format!(
                "{}: rect {rect:?} outside {:?}",
                self.name, fb.bounds
            )));
        }
        for row in 0..h {
            let src = (y + row) * width + x;
            buf[row * w..(row + 1) * w].copy_from_slice(&fb.pixels[src..src + w]);
        }
        Ok(())
    }

    fn rgb_screen(&mut self) -> Result<Vec<u32>, TesseraError> {
        Ok(self.lock().pixels.clone())
    }

    fn mark_cache_dirty(&mut self) {
        self.lock().dirty_marks += 1;
    }

    fn cursor_position(&mut self) -> Option<(i32, i32)> {
        let fb = self.lock();
        fb.cursor.filter(|&(cx, cy)| fb.bounds.contains(cx, cy))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Corners `(x0, y0, x1, y1)` of the part of display-relative `rect`
/// that lies on a display of size `bounds`. Empty ranges when it misses.
fn clip(rect: Rect, bounds: Rect) -> (u32, u32, u32, u32) {
    let x0 = (rect.x.max(0) as u32).min(bounds.width);
    let y0 = (rect.y.max(0) as u32).min(bounds.height);
    let x1 = x0.saturating_add(rect.width).min(bounds.width);
    let y1 = y0.saturating_add(rect.height).min(bounds.height);
    (x0, y0, x1, y1)
}

impl MemoryDisplayHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, Framebuffer> {
        self.fb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Another capture handle onto the same framebuffer.
    pub fn open(&self, name: impl Into<String>) -> MemoryDisplay {
        MemoryDisplay {
            name: name.into(),
            fb: Arc::clone(&self.fb),
        }
    }

    /// Set one display-relative pixel.
    pub fn set_pixel(&self, x: u32, y: u32, color: u32) {
        let mut fb = self.lock();
        let idx = y as usize * fb.bounds.width as usize + x as usize;
        fb.pixels[idx] = color;
    }

    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let fb = self.lock();
        fb.pixels[y as usize * fb.bounds.width as usize + x as usize]
    }

    /// Fill a display-relative rectangle, clipped to the display.
    pub fn fill_rect(&self, rect: Rect, color: u32) {
        let mut fb = self.lock();
        let (x0, y0, x1, y1) = clip(rect, fb.bounds);
        let width = fb.bounds.width as usize;
        for y in y0..y1 {
            let row = y as usize * width;
            fb.pixels[row + x0 as usize..row + x1 as usize].fill(color);
        }
    }

    /// Paint a display-relative rectangle, clipped to the display, with
    /// the colour `paint(x, y)` returns for each pixel.
    pub fn paint(&self, rect: Rect, paint: impl Fn(u32, u32) -> u32) {
        let mut fb = self.lock();
        let (x0, y0, x1, y1) = clip(rect, fb.bounds);
        let width = fb.bounds.width as usize;
        for y in y0..y1 {
            let row = y as usize * width;
            for x in x0..x1 {
                fb.pixels[row + x as usize] = paint(x, y);
            }
        }
    }

    pub fn fill(&self, color: u32) {
        self.lock().pixels.fill(color);
    }

    /// Change the display size; contents are reset to `fill`.
    pub fn resize(&self, width: u32, height: u32, fill: u32) {
        let mut fb = self.lock();
        fb.bounds.width = width;
        fb.bounds.height = height;
        fb.pixels = vec![fill; width as usize * height as usize];
    }

    /// Place the pointer at an absolute position (or off every display with `None`).
    pub fn move_cursor(&self, position: Option<(i32, i32)>) {
        self.lock().cursor = position;
    }

    /// Make the next `count` pixel reads fail.
    pub fn fail_next_captures(&self, count: u32) {
        self.lock().failures_pending = count;
    }

    /// How many times the capture cache has been invalidated.
    pub fn dirty_marks(&self) -> u64 {
        self.lock().dirty_marks
    }
}
