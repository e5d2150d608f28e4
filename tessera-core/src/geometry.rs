//! Tile geometry for a captured canvas.
//!
//! A canvas of `canvas_width × canvas_height` pixels is cut into
//! `segment_width × segment_height` tiles numbered left to right, top
//! down, starting at 0. Tiles on the right and bottom edges are clipped
//! to the canvas instead of overflowing it. The pseudo-ID
//! [`WHOLE_SCREEN`] addresses the entire canvas.

use serde::{Deserialize, Serialize};

/// Tile identifier. `-1` ([`WHOLE_SCREEN`]) means the whole canvas.
pub type SegmentId = i32;

/// Segment ID that addresses the whole canvas.
pub const WHOLE_SCREEN: SegmentId = -1;

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of pixels covered.
    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether the absolute point `(px, py)` lies inside this rectangle.
    pub fn contains(&self, px: i32, py: i32) -> bool {
        let px = px as i64 - self.x as i64;
        let py = py as i64 - self.y as i64;
        px >= 0 && py >= 0 && px < self.width as i64 && py < self.height as i64
    }
}

// ── Segmentation ─────────────────────────────────────────────────

/// Row-major tile layout of a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segmentation {
    canvas_width: u32,
    canvas_height: u32,
    segment_width: u32,
    segment_height: u32,
    cols: u32,
    rows: u32,
}

impl Segmentation {
    /// An empty layout that will cut canvases into tiles of the given size.
    ///
    /// # Panics
    ///
    /// Panics if either tile dimension is zero.
    pub fn new(segment_width: u32, segment_height: u32) -> Self {
        assert!(
            segment_width > 0 && segment_height > 0,
            "segment size must be > 0"
        );
        Self {
            segment_width,
            segment_height,
            ..Self::default()
        }
    }

    /// Recompute the layout for a canvas.
    ///
    /// Returns `true` when the layout changed, in which case every tile
    /// buffer sized for the previous layout is stale.
    pub fn configure(
        &mut self,
        canvas_width: u32,
        canvas_height: u32,
        segment_width: u32,
        segment_height: u32,
    ) -> bool {
        assert!(
            segment_width > 0 && segment_height > 0,
            "segment size must be > 0"
        );
        let next = Self {
            canvas_width,
            canvas_height,
            segment_width,
            segment_height,
            cols: canvas_width.div_ceil(segment_width),
            rows: canvas_height.div_ceil(segment_height),
        };
        if next == *self {
            return false;
        }
        *self = next;
        true
    }

    pub fn canvas_width(&self) -> u32 {
        self.canvas_width
    }

    pub fn canvas_height(&self) -> u32 {
        self.canvas_height
    }

    pub fn segment_width(&self) -> u32 {
        self.segment_width
    }

    pub fn segment_height(&self) -> u32 {
        self.segment_height
    }

    /// Tile columns and rows.
    pub fn grid(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    /// Number of tiles in the layout.
    pub fn segment_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// Highest valid tile ID (`-1` for an empty canvas).
    pub fn max_segment_id(&self) -> SegmentId {
        self.segment_count() as SegmentId - 1
    }

    /// Whether `id` names a tile or the whole canvas.
    pub fn is_valid(&self, id: SegmentId) -> bool {
        id == WHOLE_SCREEN || (id >= 0 && (id as usize) < self.segment_count())
    }

    /// Tile containing canvas-relative point `(x, y)`, or `None` outside the canvas.
    pub fn segment_id(&self, x: u32, y: u32) -> Option<SegmentId> {
        if x >= self.canvas_width || y >= self.canvas_height {
            return None;
        }
        let col = x / self.segment_width;
        let row = y / self.segment_height;
        Some((row * self.cols + col) as SegmentId)
    }

    /// Column and row of a tile.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a tile of this layout.
    pub fn idx_pos(&self, id: SegmentId) -> (u32, u32) {
        self.check(id);
        let id = id as u32;
        (id % self.cols, id / self.cols)
    }

    /// Canvas-relative top-left corner of a tile.
    pub fn pos(&self, id: SegmentId) -> (u32, u32) {
        if id == WHOLE_SCREEN {
            return (0, 0);
        }
        let (col, row) = self.idx_pos(id);
        (col * self.segment_width, row * self.segment_height)
    }

    /// Width and height of a tile, clipped at the right/bottom edges.
    pub fn dim(&self, id: SegmentId) -> (u32, u32) {
        if id == WHOLE_SCREEN {
            return (self.canvas_width, self.canvas_height);
        }
        let (x, y) = self.pos(id);
        (
            self.segment_width.min(self.canvas_width - x),
            self.segment_height.min(self.canvas_height - y),
        )
    }

    /// Canvas-relative rectangle covered by a tile.
    pub fn rect(&self, id: SegmentId) -> Rect {
        let (x, y) = self.pos(id);
        let (w, h) = self.dim(id);
        Rect::new(x as i32, y as i32, w, h)
    }

    pub fn pixel_count(&self, id: SegmentId) -> usize {
        let (w, h) = self.dim(id);
        w as usize * h as usize
    }

    /// Pixel count of a full (unclipped) tile, or of the canvas if smaller.
    pub fn max_pixel_count(&self) -> usize {
        self.segment_width.min(self.canvas_width) as usize
            * self.segment_height.min(self.canvas_height) as usize
    }

    fn check(&self, id: SegmentId) {
        assert!(
            id >= 0 && (id as usize) < self.segment_count(),
            "segment {id} out of range (count {})",
            self.segment_count()
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────
