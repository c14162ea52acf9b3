//! # scribble-core: Domain model for shared drawing sessions
//!
//! Everything here is synchronous and side-effect free. The runtime in
//! `scribble-collab` owns the clocks, queues and storage; this crate only
//! decides what a command means and how state evolves.
//!
//! ## Architecture
//!
//! ```text
//!  raw points ──► (pipeline) ──► SessionCommand
//!                                     │
//!                                     ▼
//!                        SessionState::process_command
//!                                     │
//!                          (CommandResult, [SessionEvent])
//!                                     │
//!                                     ▼
//!                            SessionState::apply ──► ActivitySummary
//!                                                          │
//!                                                          ▼
//!                                               ActivityIndex (LWW merge)
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: Session/user/node ids, timestamps, stroke id generator
//! - [`stroke`]: Points, brush properties, finished strokes
//! - [`command`]: Commands and `CommandResult`
//! - [`event`]: Journal events
//! - [`state`]: The session reducer
//! - [`activity`]: Activity summaries and the LWW index
//! - [`protocol`]: Manifest-tagged wire codec
//! - [`shard`]: Static shard table and rebalancing

pub mod activity;
pub mod command;
pub mod event;
pub mod ids;
pub mod protocol;
pub mod shard;
pub mod state;
pub mod stroke;

pub use activity::{ActivityIndex, ActivitySummary};
pub use command::{CommandResult, ResultCode, SessionCommand};
pub use event::{SessionEvent, SessionEventKind};
pub use ids::{fnv1a_64, NodeId, SessionId, StrokeId, StrokeIdGenerator, Timestamp, UserId};
pub use protocol::{manifest, Envelope, ProtocolError, WireMessage};
pub use shard::{shard_for, ShardError, ShardId, ShardMove, ShardTable, DEFAULT_SHARD_COUNT};
pub use state::SessionState;
pub use stroke::{Color, ConnectedStroke, Point, StrokeWidth};
