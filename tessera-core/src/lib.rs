//! # tessera-core
//!
//! Core library of the Tessera screen-sharing server.
//!
//! This crate contains:
//! - **Geometry**: `Segmentation` tiles a display into fixed-size segments
//! - **Capture**: `DisplayCapture` trait and the in-memory `MemoryDisplay`
//! - **Monitor**: `ScreenMonitor` capture loop with change detection and rate throttling
//! - **Events**: `ServerEvent` / `ClientEvent` vocabulary and coalescing keys
//! - **Codec**: `MessageCodec` for length-prefixed, compressed framing via `tokio_util`
//! - **Payloads**: `CompressedPayload` compressed once and shared between viewers
//! - **Dispatch**: `DispatchPipeline` serial and coalescing lanes with ack-driven replay
//! - **Sessions**: `ClientSession` per-connection handling and teardown
//! - **Manager**: `DisplayManager` display registry, bindings and access modes
//! - **Error**: `TesseraError`, typed and `thiserror`-based

pub mod capture;
pub mod changeset;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod geometry;
pub mod input;
pub mod manager;
pub mod monitor;
pub mod payload;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{DisplayCapture, MemoryDisplay, MemoryDisplayHandle};
pub use changeset::ChangeSet;
pub use codec::{MAX_FRAME_SIZE, MessageCodec, Outbound, ServerCodec, ViewerCodec};
pub use dispatch::DispatchPipeline;
pub use error::TesseraError;
pub use event::{ClientEvent, CoalesceKey, EventKind, SegmentData, ServerEvent};
pub use geometry::{Rect, SegmentId, Segmentation, WHOLE_SCREEN};
pub use input::{InputSink, KeyEvent, LogInputSink, MouseEvent};
pub use manager::{AccessMode, ClientId, DisplayFactory, DisplayManager};
pub use monitor::{MonitorConfig, ScreenListener, ScreenMonitor};
pub use payload::{CompressedPayload, PayloadCache, SharedPayload};
pub use session::{ClientSession, TeardownAction};
