//! Distributed activity index.
//!
//! Architecture:
//! ```text
//!   SessionEntity ──publish──► ActivityPublisher ──Majority write──► Replicator
//!                                                                      │  ▲
//!                                                 GossipServer/WsPeer ─┘  │ Status (anti-entropy)
//!                                                                         │
//!                                   IndexReader ◄── watch ◄───────────────┘
//!                                        │
//!                                        └──► IndexSubscription (every 5s, on change)
//! ```
//!
//! The index is a map `SessionId → ActivitySummary` merged last-writer-wins,
//! so replicas only ever exchange whole entries and converge regardless of
//! ordering or duplication.
//!
//! Performance targets:
//! | Operation                         | Target   |
//! |-----------------------------------|----------|
//! | Local update visible to reader    | < 1ms    |
//! | Majority write, 3 nodes, LAN      | < 10ms   |
//! | Full-state merge, 10K sessions    | < 5ms    |
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

pub mod gossip;
pub mod publisher;
pub mod reader;
pub mod replicator;

pub use gossip::{GossipServer, WsPeer};
pub use publisher::{ActivityPublisher, PublisherHandle};
pub use reader::{IndexReader, IndexSubscription};
pub use replicator::{
    GossipBody, GossipError, GossipFrame, GossipPeer, InProcessPeer, Replicator, UpdateOutcome,
    WriteConsistency,
};
