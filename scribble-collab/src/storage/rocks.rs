//! RocksDB-backed event journal.
//!
//! Column families:
//! - `events`   : Journal records, keyed by `<len:4><session_id><seq:8 BE>`
//! - `snapshots`: Latest session snapshot (LZ4 compressed), keyed by session id
//! - `metadata` : Per-session counters (highest sequence, snapshot sequence)
//!
//! The length prefix keeps one session's keys contiguous and stops a session
//! id from being a byte prefix of another. Big-endian sequence numbers make
//! RocksDB's byte order equal to journal order, so replay is a forward scan.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use scribble_core::{SessionEvent, SessionId, SessionState, Timestamp, WireMessage};

use super::journal::{EventJournal, JournalRecord, Snapshot, StoreError};

const CF_EVENTS: &str = "events";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribble_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided (usually temporary) directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-session bookkeeping stored in `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub highest_sequence: u64,
    pub snapshot_sequence: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SessionMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    sequence: u64,
    manifest: String,
    payload: Vec<u8>,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable journal on RocksDB.
pub struct RocksJournal {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the read-modify-write of session metadata on append.
    write_lock: Mutex<()>,
}

impl RocksJournal {
    /// Opens (or creates) the journal at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened event journal at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(f64::from(config.bloom_filter_bits), false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_EVENTS => {
                // Append-heavy, scanned forward on recovery
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' missing")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// `<len:4 BE><session id bytes>`
    fn session_prefix(session_id: &SessionId) -> Vec<u8> {
        let id = session_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + id.len() + 8);
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id);
        key
    }

    fn event_key(session_id: &SessionId, sequence: u64) -> Vec<u8> {
        let mut key = Self::session_prefix(session_id);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    pub fn load_metadata(&self, session_id: &SessionId) -> Result<Option<SessionMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, session_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(SessionMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every session that has journal metadata.
    pub fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            sessions.push(SessionId::new(id));
        }
        Ok(sessions)
    }
}

impl EventJournal for RocksJournal {
    fn append(&self, session_id: &SessionId, event: &SessionEvent) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let now = Timestamp::now();
        let mut meta = self.load_metadata(session_id)?.unwrap_or_else(|| SessionMetadata {
            created_at: now,
            ..SessionMetadata::default()
        });
        let sequence = meta.highest_sequence + 1;
        meta.highest_sequence = sequence;
        meta.updated_at = now;

        let record = JournalRecord::from_event(sequence, event)?;

        // Event and counter land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_events, Self::event_key(session_id, sequence), record.encode()?);
        batch.put_cf(cf_meta, session_id.as_str().as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(sequence)
    }

    fn read_from(&self, session_id: &SessionId, from: u64) -> Result<Vec<JournalRecord>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let prefix = Self::session_prefix(session_id);
        let start = Self::event_key(session_id, from);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }
            match JournalRecord::decode(&value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // Undecodable bytes: surface as a record that fails verification
                    log::warn!("Unreadable journal entry for session {session_id}: {e}");
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&key[prefix.len()..]);
                    records.push(JournalRecord {
                        sequence: u64::from_be_bytes(seq),
                        manifest: String::new(),
                        payload: value.to_vec(),
                        checksum: 0,
                    });
                }
            }
        }
        Ok(records)
    }

    fn save_snapshot(
        &self,
        session_id: &SessionId,
        sequence: u64,
        state: &SessionState,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let envelope = WireMessage::State(state.clone())
            .to_envelope()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let record = SnapshotRecord {
            sequence,
            manifest: envelope.manifest,
            payload: envelope.payload,
        };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self.load_metadata(session_id)?.unwrap_or_default();
        meta.snapshot_sequence = sequence;
        meta.updated_at = Timestamp::now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, session_id.as_str().as_bytes(), &compressed);
        batch.put_cf(cf_meta, session_id.as_str().as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Snapshot of session {session_id} at seq {sequence}: {} → {} bytes",
            encoded.len(),
            compressed.len()
        );
        Ok(())
    }

    fn load_snapshot(&self, session_id: &SessionId) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, session_id.as_str().as_bytes())? else {
            return Ok(None);
        };

        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (record, _): (SnapshotRecord, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;

        match WireMessage::from_binary(&record.payload, &record.manifest) {
            Ok(WireMessage::State(state)) => Ok(Some(Snapshot {
                sequence: record.sequence,
                state,
            })),
            Ok(other) => Err(StoreError::DeserializationError(format!(
                "snapshot of session {session_id} holds '{}'",
                other.manifest()
            ))),
            Err(e) => Err(StoreError::DeserializationError(e.to_string())),
        }
    }

    fn highest_sequence(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        Ok(self
            .load_metadata(session_id)?
            .map_or(0, |meta| meta.highest_sequence))
    }
}
