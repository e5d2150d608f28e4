//! Domain-specific error types for Tessera.
//!
//! All fallible operations return `Result<T, TesseraError>`.
//! Logic bugs (broken invariants) panic instead; everything the
//! environment can cause is typed and recoverable.

use thiserror::Error;

/// The canonical error type for the Tessera core.
#[derive(Debug, Error)]
pub enum TesseraError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// A message body could not be decompressed or deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message could not be serialized.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection (EOF on the reader).
    #[error("connection reset by peer")]
    ConnectionReset,

    // ── Capture Errors ───────────────────────────────────────────
    /// The display collaborator failed to produce pixels.
    #[error("capture failed: {0}")]
    Capture(String),

    /// A screen index did not map to a registered display.
    #[error("unknown screen: {0}")]
    UnknownScreen(u32),

    /// A segment ID is outside the current layout.
    #[error("segment {id} out of range (count {count})")]
    SegmentOutOfRange { id: i32, count: usize },

    /// Control input could not be delivered to the host.
    #[error("input injection failed: {0}")]
    Input(String),

    // ── Session Errors ───────────────────────────────────────────
    /// The client presented a credential that was rejected.
    #[error("authorization failed")]
    Unauthorized,

    /// A teardown action failed; further failures were logged.
    #[error("teardown failed: {0}")]
    Teardown(String),
}

impl From<Box<bincode::ErrorKind>> for TesseraError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TesseraError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = TesseraError::FrameTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = TesseraError::SegmentOutOfRange { id: 9, count: 4 };
        assert!(e.to_string().contains("out of range"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: TesseraError = io_err.into();
        assert!(matches!(e, TesseraError::Connection(_)));
    }
}
