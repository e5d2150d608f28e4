//! Event vocabulary exchanged between the server and its viewers.
//!
//! Every [`ServerEvent`] variant has an [`EventKind`] that declares,
//! statically, how the dispatch pipeline must treat it:
//!
//! | Kind                  | serial | mutable args | coalescing key |
//! |-----------------------|--------|--------------|----------------|
//! | connection / auth     | yes    |              | -              |
//! | screen count / resize | yes    |              | -              |
//! | alias / chat          | yes    |              | -              |
//! | `SegmentChanged`      |        | no           | kind + tile    |
//! | `SegmentUpdate`       |        | yes          | kind + tile    |
//! | `CursorMove`          |        | yes          | kind           |
//! | `CursorGone`          |        | no           | kind           |

use serde::{Deserialize, Serialize};

use crate::geometry::SegmentId;
use crate::input::{KeyEvent, MouseEvent};
use crate::manager::AccessMode;

// ── SegmentData ──────────────────────────────────────────────────

/// Contents of one tile as shipped to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentData {
    /// Every pixel of the tile has this value.
    Solid(u32),
    /// Row-major pixels.
    Pixels(Vec<u32>),
}

// ── EventKind ────────────────────────────────────────────────────

/// Discriminant of a [`ServerEvent`], carrying its dispatch metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionClosed,
    AuthorizationUpdate,
    FailedAuthorization,
    NumScreensChanged,
    ScreenGone,
    ScreenResized,
    SegmentSizeUpdate,
    SegmentChanged,
    SegmentUpdate,
    CursorMove,
    CursorGone,
    ReadInputEvents,
    AliasRegistered,
    AliasUnregistered,
    ChatMessage,
}

impl EventKind {
    /// Must be observed by the viewer in issuance order.
    pub const fn is_serial(self) -> bool {
        !matches!(
            self,
            EventKind::SegmentChanged
                | EventKind::SegmentUpdate
                | EventKind::CursorMove
                | EventKind::CursorGone
        )
    }

    /// A newer occurrence supersedes a pending one (overwrite instead of drop).
    pub const fn has_mutable_args(self) -> bool {
        matches!(self, EventKind::SegmentUpdate | EventKind::CursorMove)
    }

    /// Keyed per tile rather than per kind.
    pub const fn is_segment_scoped(self) -> bool {
        matches!(self, EventKind::SegmentChanged | EventKind::SegmentUpdate)
    }

    /// Sent without coalescing even while an earlier one is in flight.
    pub const fn bypasses_coalescing(self) -> bool {
        matches!(self, EventKind::SegmentUpdate)
    }
}

// ── CoalesceKey ──────────────────────────────────────────────────

/// Identity under which non-serial events are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoalesceKey {
    Kind(EventKind),
    Segment(EventKind, SegmentId),
}

impl CoalesceKey {
    /// Key named by a viewer acknowledgement.
    pub fn for_ack(kind: EventKind, segment: Option<SegmentId>) -> Self {
        match segment {
            Some(segment) if kind.is_segment_scoped() => CoalesceKey::Segment(kind, segment),
            _ => CoalesceKey::Kind(kind),
        }
    }

    pub fn kind(&self) -> EventKind {
        match *self {
            CoalesceKey::Kind(kind) | CoalesceKey::Segment(kind, _) => kind,
        }
    }
}

// ── ServerEvent ──────────────────────────────────────────────────

/// Server → viewer events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerEvent {
    ConnectionEstablished,
    ConnectionClosed,
    AuthorizationUpdate { granted: bool },
    FailedAuthorization,
    NumScreensChanged { count: u32 },
    ScreenGone,
    ScreenResized { width: u32, height: u32 },
    SegmentSizeUpdate { width: u32, height: u32 },
    SegmentChanged { segment: SegmentId },
    SegmentUpdate { segment: SegmentId, data: SegmentData },
    CursorMove { x: i32, y: i32 },
    CursorGone,
    ReadInputEvents { enabled: bool },
    AliasRegistered { alias: String },
    AliasUnregistered { alias: String },
    ChatMessage {
        from: String,
        to: Option<String>,
        text: String,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::ConnectionEstablished => EventKind::ConnectionEstablished,
            ServerEvent::ConnectionClosed => EventKind::ConnectionClosed,
            ServerEvent::AuthorizationUpdate { .. } => EventKind::AuthorizationUpdate,
            ServerEvent::FailedAuthorization => EventKind::FailedAuthorization,
            ServerEvent::NumScreensChanged { .. } => EventKind::NumScreensChanged,
            ServerEvent::ScreenGone => EventKind::ScreenGone,
            ServerEvent::ScreenResized { .. } => EventKind::ScreenResized,
            ServerEvent::SegmentSizeUpdate { .. } => EventKind::SegmentSizeUpdate,
            ServerEvent::SegmentChanged { .. } => EventKind::SegmentChanged,
            ServerEvent::SegmentUpdate { .. } => EventKind::SegmentUpdate,
            ServerEvent::CursorMove { .. } => EventKind::CursorMove,
            ServerEvent::CursorGone => EventKind::CursorGone,
            ServerEvent::ReadInputEvents { .. } => EventKind::ReadInputEvents,
            ServerEvent::AliasRegistered { .. } => EventKind::AliasRegistered,
            ServerEvent::AliasUnregistered { .. } => EventKind::AliasUnregistered,
            ServerEvent::ChatMessage { .. } => EventKind::ChatMessage,
        }
    }

    pub fn coalesce_key(&self) -> CoalesceKey {
        match self {
            ServerEvent::SegmentChanged { segment } | ServerEvent::SegmentUpdate { segment, .. } => {
                CoalesceKey::Segment(self.kind(), *segment)
            }
            _ => CoalesceKey::Kind(self.kind()),
        }
    }
}

// ── ClientEvent ──────────────────────────────────────────────────

/// Viewer → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Bind to a display.
    SelectScreen {
        screen: u32,
        mode: AccessMode,
        password: Option<String>,
    },
    /// Fetch the current contents of a tile (or [`WHOLE_SCREEN`](crate::geometry::WHOLE_SCREEN)).
    GetSegment { segment: SegmentId },
    /// The viewer applied the last event sent under this key.
    EventAck {
        kind: EventKind,
        segment: Option<SegmentId>,
    },
    /// Minimum period between frames this viewer wants; `None` withdraws it.
    RefreshRate { period_ms: Option<u64> },
    Mouse(MouseEvent),
    Key(KeyEvent),
    Goodbye,
}
