//! Session commands and their results.
//!
//! Every command names the session it targets. Results are plain values:
//! `NoOp` is a success that changed nothing, only `BadRequest`,
//! `Unauthorized` and `TimeOut` count as errors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{SessionId, StrokeId, UserId};
use crate::stroke::ConnectedStroke;

/// Outcome class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    NoOp,
    BadRequest,
    /// Reserved. Nothing in the session core produces it.
    Unauthorized,
    TimeOut,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Ok => "ok",
            ResultCode::NoOp => "no-op",
            ResultCode::BadRequest => "bad request",
            ResultCode::Unauthorized => "unauthorized",
            ResultCode::TimeOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Result of a command: a code plus an optional human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub code: ResultCode,
    pub message: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: None,
        }
    }

    pub fn no_op(message: impl Into<String>) -> Self {
        Self::with_message(ResultCode::NoOp, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_message(ResultCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_message(ResultCode::Unauthorized, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::with_message(ResultCode::TimeOut, message)
    }

    fn with_message(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// True for everything except `Ok` and `NoOp`.
    pub fn is_error(&self) -> bool {
        !matches!(self.code, ResultCode::Ok | ResultCode::NoOp)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// A state-changing request against one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionCommand {
    AddStroke {
        session_id: SessionId,
        stroke: ConnectedStroke,
    },
    RemoveStroke {
        session_id: SessionId,
        stroke_id: StrokeId,
    },
    ClearStrokes {
        session_id: SessionId,
    },
    AddUser {
        session_id: SessionId,
        user_id: UserId,
    },
    RemoveUser {
        session_id: SessionId,
        user_id: UserId,
    },
}

impl SessionCommand {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionCommand::AddStroke { session_id, .. }
            | SessionCommand::RemoveStroke { session_id, .. }
            | SessionCommand::ClearStrokes { session_id }
            | SessionCommand::AddUser { session_id, .. }
            | SessionCommand::RemoveUser { session_id, .. } => session_id,
        }
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::AddStroke { .. } => "AddStroke",
            SessionCommand::RemoveStroke { .. } => "RemoveStroke",
            SessionCommand::ClearStrokes { .. } => "ClearStrokes",
            SessionCommand::AddUser { .. } => "AddUser",
            SessionCommand::RemoveUser { .. } => "RemoveUser",
        }
    }
}
