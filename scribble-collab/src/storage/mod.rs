//! Event-sourced persistence for session entities.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  append(event)   ┌──────────────────────┐
//! │ SessionEntity │ ───────────────► │ dyn EventJournal     │
//! │ (one writer   │  save_snapshot   │                      │
//! │  per session) │ ───────────────► │  MemoryJournal       │
//! └───────┬───────┘                  │  RocksJournal        │
//!         │ on start                 │   CF "events"        │
//!         ▼                          │   CF "snapshots"     │
//! ┌───────────────┐  read_from(seq)  │   CF "metadata"      │
//! │ recover()     │ ◄─────────────── │                      │
//! └───────────────┘                  └──────────────────────┘
//! ```
//!
//! ## Performance Targets
//!
//! | Metric                         | Target  | Reference                     |
//! |--------------------------------|---------|-------------------------------|
//! | Append (1 event)               | <50μs   | DDIA Ch.3, Write-Ahead Logs  |
//! | Recover (snapshot + 99 events) | <5ms    | DDIA Ch.11, Event Sourcing   |
//! | Snapshot compression ratio     | 5:1     | Patterson §5.7, Compression  |

pub mod journal;
pub mod rocks;

pub use journal::{
    recover, EventJournal, JournalRecord, MemoryJournal, Recovered, Snapshot, StoreError,
};
pub use rocks::{RocksJournal, SessionMetadata, StoreConfig};
