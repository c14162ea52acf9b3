//! Session State Core: the pure reducer behind every drawing session.
//!
//! ```text
//!   command ──► process_command(&state, now) ──► (CommandResult, [SessionEvent])
//!                                                              │
//!   state ◄──────────── apply(&mut state, &event) ◄────────────┘
//! ```
//!
//! `process_command` never mutates; it only decides. `apply` is the only
//! way state changes, which is what makes replaying a journal produce the
//! exact state the live entity had.
//!
//! Commands are idempotent against current membership: adding something
//! that is already present is a `NoOp`, removing something absent is a
//! `BadRequest`. Neither emits events.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::activity::ActivitySummary;
use crate::command::{CommandResult, SessionCommand};
use crate::event::{SessionEvent, SessionEventKind};
use crate::ids::{SessionId, StrokeId, Timestamp, UserId};
use crate::stroke::ConnectedStroke;

/// Authoritative state of one drawing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub strokes: BTreeMap<StrokeId, ConnectedStroke>,
    pub connected_users: BTreeSet<UserId>,
    /// Timestamp of the newest applied event. `Timestamp::ZERO` until then.
    pub last_update: Timestamp,
    /// The newest applied event was `SessionClosed`.
    pub closed: bool,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            strokes: BTreeMap::new(),
            connected_users: BTreeSet::new(),
            last_update: Timestamp::ZERO,
            closed: false,
        }
    }

    /// No strokes and no users.
    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty() && self.connected_users.is_empty()
    }

    /// Decides the outcome of `command` against the current state.
    ///
    /// `now` is stamped onto every produced event.
    pub fn process_command(
        &self,
        command: &SessionCommand,
        now: Timestamp,
    ) -> (CommandResult, Vec<SessionEvent>) {
        if command.session_id() != &self.session_id {
            return (
                CommandResult::bad_request(format!(
                    "{} for session {} delivered to session {}",
                    command.name(),
                    command.session_id(),
                    self.session_id
                )),
                Vec::new(),
            );
        }

        let kind = match command {
            SessionCommand::AddStroke { stroke, .. } => {
                if self.strokes.contains_key(&stroke.id) {
                    return (
                        CommandResult::no_op(format!("stroke {} already exists", stroke.id)),
                        Vec::new(),
                    );
                }
                SessionEventKind::StrokeAdded(stroke.clone())
            }
            SessionCommand::RemoveStroke { stroke_id, .. } => {
                if !self.strokes.contains_key(stroke_id) {
                    return (
                        CommandResult::bad_request(format!("stroke {stroke_id} does not exist")),
                        Vec::new(),
                    );
                }
                SessionEventKind::StrokeRemoved(*stroke_id)
            }
            SessionCommand::ClearStrokes { .. } => {
                if self.strokes.is_empty() {
                    return (CommandResult::no_op("no strokes to clear"), Vec::new());
                }
                SessionEventKind::StrokesCleared
            }
            SessionCommand::AddUser { user_id, .. } => {
                if self.connected_users.contains(user_id) {
                    return (
                        CommandResult::no_op(format!("user {user_id} already connected")),
                        Vec::new(),
                    );
                }
                SessionEventKind::UserAdded(user_id.clone())
            }
            SessionCommand::RemoveUser { user_id, .. } => {
                if !self.connected_users.contains(user_id) {
                    return (
                        CommandResult::bad_request(format!("user {user_id} is not connected")),
                        Vec::new(),
                    );
                }
                SessionEventKind::UserRemoved(user_id.clone())
            }
        };

        (
            CommandResult::ok(),
            vec![SessionEvent::new(self.session_id.clone(), now, kind)],
        )
    }

    /// Applies one event. `last_update` never moves backwards.
    pub fn apply(&mut self, event: &SessionEvent) {
        match &event.kind {
            SessionEventKind::StrokeAdded(stroke) => {
                self.strokes.insert(stroke.id, stroke.clone());
            }
            SessionEventKind::StrokeRemoved(stroke_id) => {
                self.strokes.remove(stroke_id);
            }
            SessionEventKind::StrokesCleared => self.strokes.clear(),
            SessionEventKind::UserAdded(user_id) => {
                self.connected_users.insert(user_id.clone());
            }
            SessionEventKind::UserRemoved(user_id) => {
                self.connected_users.remove(user_id);
            }
            // Strokes survive; nobody is connected to a closed session.
            SessionEventKind::SessionClosed => self.connected_users.clear(),
        }
        self.closed = event.is_closed();
        self.last_update = self.last_update.max(event.timestamp);
    }

    /// Rebuilds state from an ordered event log.
    pub fn replay<'a>(
        session_id: SessionId,
        events: impl IntoIterator<Item = &'a SessionEvent>,
    ) -> Self {
        let mut state = SessionState::new(session_id);
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Discovery summary: a tombstone once the session has closed.
    pub fn activity_summary(&self) -> ActivitySummary {
        if self.closed {
            return ActivitySummary::removed(self.session_id.clone(), self.last_update);
        }
        ActivitySummary::active(
            self.session_id.clone(),
            u32::try_from(self.connected_users.len()).unwrap_or(u32::MAX),
            self.last_update,
        )
    }
}
