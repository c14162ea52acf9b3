//! Per-session append-only event journal.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  session "s1"                                        │
//! │                                                      │
//! │  records:  [1:ua] [2:sa] [3:sa] ... [100:sr] [101:sa] │
//! │                                       ▲              │
//! │  snapshot: ───────────────────────────┘ (seq 100)    │
//! │                                                      │
//! │  recover = snapshot state + records after seq 100    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Sequence numbers start at 1 and are dense per session. Every record
//! carries the wire manifest of its event and a checksum; a record that
//! fails verification is logged and skipped during recovery instead of
//! failing the whole session.
//!
//! Reference: Kleppmann, DDIA, Chapter 11 (Event Sourcing)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use scribble_core::{Envelope, SessionEvent, SessionId, SessionState, WireMessage};

/// One persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Per-session sequence number, starting at 1
    pub sequence: u64,
    /// Wire manifest of the event ("sa", "ua", ...)
    pub manifest: String,
    /// Encoded event
    pub payload: Vec<u8>,
    /// FNV-1a fold over the other fields
    pub checksum: u32,
}

impl JournalRecord {
    pub fn new(sequence: u64, envelope: Envelope) -> Self {
        let checksum = Self::compute_checksum(sequence, &envelope.manifest, &envelope.payload);
        Self {
            sequence,
            manifest: envelope.manifest,
            payload: envelope.payload,
            checksum,
        }
    }

    pub fn from_event(sequence: u64, event: &SessionEvent) -> Result<Self, StoreError> {
        let envelope = WireMessage::Event(event.clone())
            .to_envelope()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(Self::new(sequence, envelope))
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, &self.manifest, &self.payload)
    }

    fn compute_checksum(sequence: u64, manifest: &str, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in sequence
            .to_be_bytes()
            .iter()
            .chain(manifest.as_bytes())
            .chain(payload)
        {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// Decodes the event, rejecting records that are not events.
    pub fn event(&self) -> Result<SessionEvent, StoreError> {
        match WireMessage::from_binary(&self.payload, &self.manifest) {
            Ok(WireMessage::Event(event)) => Ok(event),
            Ok(other) => Err(StoreError::DeserializationError(format!(
                "record {} holds '{}', not an event",
                self.sequence,
                other.manifest()
            ))),
            Err(e) => Err(StoreError::DeserializationError(e.to_string())),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Full session state as of `sequence`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub sequence: u64,
    pub state: SessionState,
}

/// Durable, ordered event storage keyed by session.
///
/// Implementations must be safe to share between session entities; a
/// single session only ever has one writer at a time.
pub trait EventJournal: Send + Sync {
    /// Appends one event and returns its sequence number.
    fn append(&self, session_id: &SessionId, event: &SessionEvent) -> Result<u64, StoreError>;

    /// Records with `sequence >= from`, in order.
    fn read_from(&self, session_id: &SessionId, from: u64) -> Result<Vec<JournalRecord>, StoreError>;

    fn save_snapshot(
        &self,
        session_id: &SessionId,
        sequence: u64,
        state: &SessionState,
    ) -> Result<(), StoreError>;

    fn load_snapshot(&self, session_id: &SessionId) -> Result<Option<Snapshot>, StoreError>;

    /// Highest sequence number written for the session, 0 if none.
    fn highest_sequence(&self, session_id: &SessionId) -> Result<u64, StoreError>;
}

/// Outcome of [`recover`].
#[derive(Debug, Clone)]
pub struct Recovered {
    pub state: SessionState,
    /// Sequence number of the last event applied
    pub sequence: u64,
    /// Sequence number of the snapshot used, 0 if none
    pub snapshot_sequence: u64,
    /// Events replayed on top of the snapshot
    pub replayed: usize,
    /// Records skipped because they failed verification or decoding
    pub skipped: usize,
}

/// Rebuilds a session: latest snapshot, then every later event in order.
pub fn recover(journal: &dyn EventJournal, session_id: &SessionId) -> Result<Recovered, StoreError> {
    let (mut state, snapshot_sequence) = match journal.load_snapshot(session_id)? {
        Some(snapshot) => (snapshot.state, snapshot.sequence),
        None => (SessionState::new(session_id.clone()), 0),
    };

    let mut sequence = snapshot_sequence;
    let mut replayed = 0;
    let mut skipped = 0;
    for record in journal.read_from(session_id, snapshot_sequence + 1)? {
        sequence = sequence.max(record.sequence);
        if !record.verify() {
            log::warn!(
                "Skipping corrupted record {} of session {session_id}: checksum mismatch",
                record.sequence
            );
            skipped += 1;
            continue;
        }
        match record.event() {
            Ok(event) => {
                state.apply(&event);
                replayed += 1;
            }
            Err(e) => {
                log::warn!("Skipping record {} of session {session_id}: {e}", record.sequence);
                skipped += 1;
            }
        }
    }

    Ok(Recovered {
        state,
        sequence,
        snapshot_sequence,
        replayed,
        skipped,
    })
}

// ─── In-memory journal ────────────────────────────────────────────────

#[derive(Default)]
struct SessionLog {
    records: Vec<JournalRecord>,
    snapshot: Option<Snapshot>,
}

/// Process-local journal. Lost on exit; used for tests and single-process runs.
#[derive(Default)]
pub struct MemoryJournal {
    sessions: Mutex<HashMap<SessionId, SessionLog>>,
    fail_appends: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent append fail until reset.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Raw records for a session.
    pub fn records(&self, session_id: &SessionId) -> Vec<JournalRecord> {
        self.lock()
            .get(session_id)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Flips a record's checksum so it no longer verifies.
    pub fn corrupt(&self, session_id: &SessionId, sequence: u64) -> bool {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .and_then(|log| log.records.iter_mut().find(|r| r.sequence == sequence));
        match record {
            Some(record) => {
                record.checksum ^= 0xdead_beef;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionLog>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventJournal for MemoryJournal {
    fn append(&self, session_id: &SessionId, event: &SessionEvent) -> Result<u64, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("journal rejects writes".into()));
        }
        let mut sessions = self.lock();
        let log = sessions.entry(session_id.clone()).or_default();
        let sequence = log.records.last().map_or(0, |r| r.sequence) + 1;
        log.records.push(JournalRecord::from_event(sequence, event)?);
        Ok(sequence)
    }

    fn read_from(&self, session_id: &SessionId, from: u64) -> Result<Vec<JournalRecord>, StoreError> {
        Ok(self
            .lock()
            .get(session_id)
            .map(|log| {
                log.records
                    .iter()
                    .filter(|r| r.sequence >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn save_snapshot(
        &self,
        session_id: &SessionId,
        sequence: u64,
        state: &SessionState,
    ) -> Result<(), StoreError> {
        self.lock().entry(session_id.clone()).or_default().snapshot = Some(Snapshot {
            sequence,
            state: state.clone(),
        });
        Ok(())
    }

    fn load_snapshot(&self, session_id: &SessionId) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.lock().get(session_id).and_then(|log| log.snapshot.clone()))
    }

    fn highest_sequence(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .get(session_id)
            .and_then(|log| log.records.last())
            .map_or(0, |r| r.sequence))
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Writes are currently refused
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Journal unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
