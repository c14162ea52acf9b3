//! # scribble-collab: Runtime for shared drawing sessions
//!
//! Hosts session entities, turns raw pointer input into strokes, fans
//! session events out to local clients and keeps a cluster-wide index of
//! live sessions.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──► LocalSessionProxy ──► StrokePipeline ──► SessionRouter
//!     ▲              │                                       │
//!     │              └──────── subscribe ───────────┐        ▼
//!     │                                             ▼   SessionRegion
//!     └────── OutputChannel ◄── fan-out ◄── SessionEntity ──► EventJournal
//!                                                   │        (RocksDB / memory)
//!                                                   ▼
//!                                          ActivityPublisher ──► Replicator ◄──► peers
//!                                                                    │
//!                                                                    ▼
//!                                                               IndexReader
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Node configuration (JSON file + `SCRIBBLE_*` env overrides)
//! - [`storage`]: Event journal and snapshots, RocksDB-backed
//! - [`entity`]: The event-sourced session actor
//! - [`region`]: Entity hosting, passivation, shard routing
//! - [`pipeline`]: Stroke continuity and batched dispatch
//! - [`proxy`]: Per-node session proxy with client fan-out
//! - [`remote`]: Shard requests and subscriptions between nodes over WebSocket
//! - [`index`]: Replicated activity index (LWW) and gossip
//! - [`node`]: Everything above wired into one process
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Tracker batch of 100 points | <50µs |
//! | Journal append (memory) | <5µs |
//! | Journal append (RocksDB, no fsync) | <50µs |
//! | Command round-trip, local entity | <1ms |

pub mod config;
pub mod entity;
pub mod index;
pub mod node;
pub mod pipeline;
pub mod proxy;
pub mod region;
pub mod remote;
pub mod storage;

pub use config::{
    ConfigError, IndexConfig, NodeConfig, PeerConfig, PipelineConfig, ProxyConfig, SessionConfig,
};
pub use entity::{
    EntityHandle, Lifeline, SessionEntity, SessionRequest, SubscribeAck, Subscriber, UnsubscribeAck,
};
pub use index::{
    ActivityPublisher, GossipPeer, GossipServer, IndexReader, IndexSubscription, InProcessPeer,
    PublisherHandle, Replicator, UpdateOutcome, WriteConsistency, WsPeer,
};
pub use node::{Node, NodeError};
pub use pipeline::{CommandSink, ContinuityTracker, StrokeInput, StrokePipeline};
pub use proxy::{LocalSessionProxy, OutputChannel, PaintMessage, ProxyHandle, ProxyRegistry, ProxyStats};
pub use region::{
    AskError, LoopbackTransport, RegionStats, SessionRegion, SessionRouter, ShardTransport,
};
pub use remote::{ShardFrame, ShardReply, WsShardTransport};
pub use storage::{EventJournal, MemoryJournal, RocksJournal, StoreConfig, StoreError};
