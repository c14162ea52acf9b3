//! Manifest-tagged wire codec for everything that is persisted or sent
//! between nodes.
//!
//! Frame format (bincode-encoded):
//! ```text
//! ┌───────────────┬──────────────────────────────┐
//! │ manifest      │ payload                      │
//! │ 2-3 chars     │ bincode of the tagged shape  │
//! └───────────────┴──────────────────────────────┘
//! ```
//!
//! Decoding dispatches purely on the manifest; a payload whose shape does
//! not match its manifest is rejected rather than guessed at.
//!
//! Reference: Kleppmann, DDIA, Chapter 4 (Encoding and Evolution)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivitySummary;
use crate::command::SessionCommand;
use crate::event::{SessionEvent, SessionEventKind};
use crate::ids::SessionId;
use crate::state::SessionState;

/// Manifest tags. Short on purpose: every journal record carries one.
pub mod manifest {
    pub const STROKE_ADDED: &str = "sa";
    pub const STROKE_REMOVED: &str = "sr";
    pub const STROKES_CLEARED: &str = "sc";
    pub const USER_ADDED: &str = "ua";
    pub const USER_REMOVED: &str = "ur";
    pub const SESSION_CLOSED: &str = "dc";
    pub const GET_STATE: &str = "gs";
    pub const GET_USERS: &str = "gu";
    pub const SUBSCRIBE: &str = "su";
    pub const SUBSCRIBE_ACK: &str = "sak";
    pub const UNSUBSCRIBE: &str = "uu";
    pub const UNSUBSCRIBE_ACK: &str = "uak";
    pub const ADD_STROKE: &str = "as";
    pub const REMOVE_STROKE: &str = "rs";
    pub const CLEAR_STROKES: &str = "cs";
    pub const ADD_USER: &str = "au";
    pub const REMOVE_USER: &str = "ru";
    pub const ACTIVITY_UPDATE: &str = "da";
    pub const SESSION_STATE: &str = "ds";

    pub const ALL: &[&str] = &[
        STROKE_ADDED,
        STROKE_REMOVED,
        STROKES_CLEARED,
        USER_ADDED,
        USER_REMOVED,
        SESSION_CLOSED,
        GET_STATE,
        GET_USERS,
        SUBSCRIBE,
        SUBSCRIBE_ACK,
        UNSUBSCRIBE,
        UNSUBSCRIBE_ACK,
        ADD_STROKE,
        REMOVE_STROKE,
        CLEAR_STROKES,
        ADD_USER,
        REMOVE_USER,
        ACTIVITY_UPDATE,
        SESSION_STATE,
    ];
}

/// Every message shape that has a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Event(SessionEvent),
    Command(SessionCommand),
    GetState { session_id: SessionId },
    GetUsers { session_id: SessionId },
    Subscribe { session_id: SessionId, subscriber: Uuid },
    SubscribeAck { session_id: SessionId },
    Unsubscribe { session_id: SessionId, subscriber: Uuid },
    UnsubscribeAck { session_id: SessionId },
    Activity(ActivitySummary),
    State(SessionState),
}

#[derive(Serialize, Deserialize)]
struct SessionRef {
    session_id: SessionId,
}

#[derive(Serialize, Deserialize)]
struct SubscriberRef {
    session_id: SessionId,
    subscriber: Uuid,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl WireMessage {
    /// Manifest tag selecting this message's shape.
    pub fn manifest(&self) -> &'static str {
        match self {
            WireMessage::Event(event) => event_manifest(&event.kind),
            WireMessage::Command(command) => command_manifest(command),
            WireMessage::GetState { .. } => manifest::GET_STATE,
            WireMessage::GetUsers { .. } => manifest::GET_USERS,
            WireMessage::Subscribe { .. } => manifest::SUBSCRIBE,
            WireMessage::SubscribeAck { .. } => manifest::SUBSCRIBE_ACK,
            WireMessage::Unsubscribe { .. } => manifest::UNSUBSCRIBE,
            WireMessage::UnsubscribeAck { .. } => manifest::UNSUBSCRIBE_ACK,
            WireMessage::Activity(_) => manifest::ACTIVITY_UPDATE,
            WireMessage::State(_) => manifest::SESSION_STATE,
        }
    }

    /// Session this message concerns.
    pub fn session_id(&self) -> &SessionId {
        match self {
            WireMessage::Event(event) => &event.session_id,
            WireMessage::Command(command) => command.session_id(),
            WireMessage::GetState { session_id }
            | WireMessage::GetUsers { session_id }
            | WireMessage::Subscribe { session_id, .. }
            | WireMessage::SubscribeAck { session_id }
            | WireMessage::Unsubscribe { session_id, .. }
            | WireMessage::UnsubscribeAck { session_id } => session_id,
            WireMessage::Activity(summary) => &summary.session_id,
            WireMessage::State(state) => &state.session_id,
        }
    }

    /// Encodes the payload only. The manifest travels separately.
    pub fn to_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            WireMessage::Event(event) => encode(event),
            WireMessage::Command(command) => encode(command),
            WireMessage::GetState { session_id }
            | WireMessage::GetUsers { session_id }
            | WireMessage::SubscribeAck { session_id }
            | WireMessage::UnsubscribeAck { session_id } => encode(&SessionRef {
                session_id: session_id.clone(),
            }),
            WireMessage::Subscribe {
                session_id,
                subscriber,
            }
            | WireMessage::Unsubscribe {
                session_id,
                subscriber,
            } => encode(&SubscriberRef {
                session_id: session_id.clone(),
                subscriber: *subscriber,
            }),
            WireMessage::Activity(summary) => encode(summary),
            WireMessage::State(state) => encode(state),
        }
    }

    /// Decodes a payload, dispatching on `manifest`.
    pub fn from_binary(bytes: &[u8], manifest: &str) -> Result<Self, ProtocolError> {
        match manifest {
            manifest::STROKE_ADDED
            | manifest::STROKE_REMOVED
            | manifest::STROKES_CLEARED
            | manifest::USER_ADDED
            | manifest::USER_REMOVED
            | manifest::SESSION_CLOSED => {
                let event: SessionEvent = decode(bytes)?;
                check(manifest, event_manifest(&event.kind))?;
                Ok(WireMessage::Event(event))
            }
            manifest::ADD_STROKE
            | manifest::REMOVE_STROKE
            | manifest::CLEAR_STROKES
            | manifest::ADD_USER
            | manifest::REMOVE_USER => {
                let command: SessionCommand = decode(bytes)?;
                check(manifest, command_manifest(&command))?;
                Ok(WireMessage::Command(command))
            }
            manifest::GET_STATE => {
                let r: SessionRef = decode(bytes)?;
                Ok(WireMessage::GetState {
                    session_id: r.session_id,
                })
            }
            manifest::GET_USERS => {
                let r: SessionRef = decode(bytes)?;
                Ok(WireMessage::GetUsers {
                    session_id: r.session_id,
                })
            }
            manifest::SUBSCRIBE => {
                let r: SubscriberRef = decode(bytes)?;
                Ok(WireMessage::Subscribe {
                    session_id: r.session_id,
                    subscriber: r.subscriber,
                })
            }
            manifest::SUBSCRIBE_ACK => {
                let r: SessionRef = decode(bytes)?;
                Ok(WireMessage::SubscribeAck {
                    session_id: r.session_id,
                })
            }
            manifest::UNSUBSCRIBE => {
                let r: SubscriberRef = decode(bytes)?;
                Ok(WireMessage::Unsubscribe {
                    session_id: r.session_id,
                    subscriber: r.subscriber,
                })
            }
            manifest::UNSUBSCRIBE_ACK => {
                let r: SessionRef = decode(bytes)?;
                Ok(WireMessage::UnsubscribeAck {
                    session_id: r.session_id,
                })
            }
            manifest::ACTIVITY_UPDATE => Ok(WireMessage::Activity(decode(bytes)?)),
            manifest::SESSION_STATE => Ok(WireMessage::State(decode(bytes)?)),
            other => Err(ProtocolError::UnknownManifest(other.to_string())),
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Ok(Envelope {
            manifest: self.manifest().to_string(),
            payload: self.to_binary()?,
        })
    }

    /// Single-buffer form: manifest and payload together.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_envelope()?.encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Envelope::decode(bytes)?.open()
    }
}

fn check(expected: &str, actual: &'static str) -> Result<(), ProtocolError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProtocolError::ManifestMismatch {
            manifest: expected.to_string(),
            actual,
        })
    }
}

pub fn event_manifest(kind: &SessionEventKind) -> &'static str {
    match kind {
        SessionEventKind::StrokeAdded(_) => manifest::STROKE_ADDED,
        SessionEventKind::StrokeRemoved(_) => manifest::STROKE_REMOVED,
        SessionEventKind::StrokesCleared => manifest::STROKES_CLEARED,
        SessionEventKind::UserAdded(_) => manifest::USER_ADDED,
        SessionEventKind::UserRemoved(_) => manifest::USER_REMOVED,
        SessionEventKind::SessionClosed => manifest::SESSION_CLOSED,
    }
}

pub fn command_manifest(command: &SessionCommand) -> &'static str {
    match command {
        SessionCommand::AddStroke { .. } => manifest::ADD_STROKE,
        SessionCommand::RemoveStroke { .. } => manifest::REMOVE_STROKE,
        SessionCommand::ClearStrokes { .. } => manifest::CLEAR_STROKES,
        SessionCommand::AddUser { .. } => manifest::ADD_USER,
        SessionCommand::RemoveUser { .. } => manifest::REMOVE_USER,
    }
}

/// A manifest plus its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub manifest: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Decodes the payload according to the manifest.
    pub fn open(&self) -> Result<WireMessage, ProtocolError> {
        WireMessage::from_binary(&self.payload, &self.manifest)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown manifest: {0}")]
    UnknownManifest(String),

    #[error("Payload for manifest '{manifest}' decoded as '{actual}'")]
    ManifestMismatch {
        manifest: String,
        actual: &'static str,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
