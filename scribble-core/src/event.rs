//! Persisted session events.

use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, StrokeId, Timestamp, UserId};
use crate::stroke::ConnectedStroke;

/// One entry of a session's append-only journal.
///
/// `timestamp` is the wall-clock time at which the originating command was
/// processed. Replay uses it instead of the replay-time clock so a rebuilt
/// state is identical to the one that was live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub timestamp: Timestamp,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEventKind {
    StrokeAdded(ConnectedStroke),
    StrokeRemoved(StrokeId),
    StrokesCleared,
    UserAdded(UserId),
    UserRemoved(UserId),
    /// Written once when an idle session is passivated.
    SessionClosed,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, timestamp: Timestamp, kind: SessionEventKind) -> Self {
        Self {
            session_id,
            timestamp,
            kind,
        }
    }

    pub fn closed(session_id: SessionId, timestamp: Timestamp) -> Self {
        Self::new(session_id, timestamp, SessionEventKind::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.kind, SessionEventKind::SessionClosed)
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self.kind {
            SessionEventKind::StrokeAdded(_) => "StrokeAdded",
            SessionEventKind::StrokeRemoved(_) => "StrokeRemoved",
            SessionEventKind::StrokesCleared => "StrokesCleared",
            SessionEventKind::UserAdded(_) => "UserAdded",
            SessionEventKind::UserRemoved(_) => "UserRemoved",
            SessionEventKind::SessionClosed => "SessionClosed",
        }
    }
}
