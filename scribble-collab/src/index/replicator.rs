//! Replicator: owns this node's copy of the activity index and keeps it
//! converging with peers.
//!
//! ```text
//!   update(summary, Majority) ──► merge locally ──► Write ──► peers (concurrent)
//!                                      │                 ◄── WriteAck × ⌊n/2⌋
//!                                      ▼
//!                            watch<Arc<ActivityIndex>>  ──► readers
//!
//!   every gossip_interval: Status(full index) ⇄ next peer (round-robin)
//! ```
//!
//! Writes are last-writer-wins per session (see [`ActivityIndex::merge`]),
//! so frames may be duplicated, reordered or lost and every replica still
//! converges once anti-entropy has run.
//!
//! Tombstones are pruned only once they are older than the convergence
//! horizon, a few full gossip rotations over every peer. Within that
//! window every reachable replica has seen the tombstone.
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types" (2011)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};

use scribble_core::{ActivityIndex, ActivitySummary, NodeId, Timestamp};

// ─── Wire frames ────────────────────────────────────────────────────

/// One gossip exchange unit. Responses echo the request's `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipFrame {
    pub from: NodeId,
    pub request_id: u64,
    pub body: GossipBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipBody {
    /// Push of freshly written entries. Answered with `WriteAck`.
    Write { entries: Vec<ActivitySummary> },
    WriteAck,
    /// Full-state exchange. Answered with the responder's full state.
    Status { entries: Vec<ActivitySummary> },
}

impl GossipFrame {
    pub fn encode(&self) -> Result<Vec<u8>, GossipError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| GossipError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GossipError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| GossipError::Codec(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GossipError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Peer connection closed")]
    Closed,

    #[error("Peer did not answer in time")]
    Timeout,

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Peer sent no answer to {0}")]
    NoAnswer(&'static str),
}

/// A remote replica reachable by request/response.
pub trait GossipPeer: Send + Sync {
    fn node_id(&self) -> &NodeId;

    fn exchange(&self, frame: GossipFrame) -> BoxFuture<'static, Result<GossipFrame, GossipError>>;
}

/// Peer living in the same process. Used by tests and single-binary clusters.
pub struct InProcessPeer {
    node_id: NodeId,
    replicator: Replicator,
}

impl InProcessPeer {
    pub fn new(replicator: Replicator) -> Self {
        Self {
            node_id: replicator.node_id().clone(),
            replicator,
        }
    }
}

impl GossipPeer for InProcessPeer {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn exchange(&self, frame: GossipFrame) -> BoxFuture<'static, Result<GossipFrame, GossipError>> {
        let replicator = self.replicator.clone();
        Box::pin(async move {
            let kind = frame.body.name();
            replicator
                .handle_frame(frame)
                .await
                .ok_or(GossipError::NoAnswer(kind))
        })
    }
}

impl GossipBody {
    fn name(&self) -> &'static str {
        match self {
            GossipBody::Write { .. } => "Write",
            GossipBody::WriteAck => "WriteAck",
            GossipBody::Status { .. } => "Status",
        }
    }
}

// ─── Replicator ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConsistency {
    Local,
    /// Wait for a majority of all replicas, this one included.
    Majority { timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    /// Applied locally, but too few peers acknowledged in time.
    /// Anti-entropy still spreads the write later.
    Timeout { acks: usize, required: usize },
    /// The replicator is gone.
    Stopped,
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Success)
    }
}

enum Mail {
    Update {
        summary: ActivitySummary,
        consistency: WriteConsistency,
        reply: oneshot::Sender<UpdateOutcome>,
    },
    Prune {
        cutoff: Timestamp,
        reply: oneshot::Sender<usize>,
    },
    Frame {
        frame: GossipFrame,
        reply: oneshot::Sender<Option<GossipFrame>>,
    },
    Merge {
        entries: Vec<ActivitySummary>,
        reply: Option<oneshot::Sender<()>>,
    },
    AddPeer(Arc<dyn GossipPeer>),
    RemovePeer(NodeId),
    SyncNow {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the replicator task.
#[derive(Clone)]
pub struct Replicator {
    node_id: NodeId,
    mailbox: mpsc::UnboundedSender<Mail>,
    changes: watch::Receiver<Arc<ActivityIndex>>,
}

impl Replicator {
    /// Spawns the replicator. `gossip_interval` paces anti-entropy rounds,
    /// `exchange_timeout` bounds each round trip.
    pub fn spawn(node_id: NodeId, gossip_interval: Duration, exchange_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (changes_tx, changes) = watch::channel(Arc::new(ActivityIndex::new()));
        let actor = ReplicatorActor {
            node_id: node_id.clone(),
            index: ActivityIndex::new(),
            peers: BTreeMap::new(),
            next_peer: 0,
            next_request: 0,
            changes: changes_tx,
            mailbox: tx.downgrade(),
            gossip_interval,
            exchange_timeout,
        };
        tokio::spawn(actor.run(rx, gossip_interval));
        Self {
            node_id,
            mailbox: tx,
            changes,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub async fn update(&self, summary: ActivitySummary, consistency: WriteConsistency) -> UpdateOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .mailbox
            .send(Mail::Update {
                summary,
                consistency,
                reply,
            })
            .is_err()
        {
            return UpdateOutcome::Stopped;
        }
        rx.await.unwrap_or(UpdateOutcome::Stopped)
    }

    /// Drops tombstones last updated before `cutoff`. Returns how many.
    pub async fn prune(&self, cutoff: Timestamp) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.mailbox.send(Mail::Prune { cutoff, reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Answers a frame received from a peer.
    pub async fn handle_frame(&self, frame: GossipFrame) -> Option<GossipFrame> {
        let (reply, rx) = oneshot::channel();
        self.mailbox.send(Mail::Frame { frame, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub fn add_peer(&self, peer: Arc<dyn GossipPeer>) {
        let _ = self.mailbox.send(Mail::AddPeer(peer));
    }

    pub fn remove_peer(&self, node_id: NodeId) {
        let _ = self.mailbox.send(Mail::RemovePeer(node_id));
    }

    /// Runs one full-state exchange with every peer and waits for the
    /// answers to be merged. Returns how many peers answered.
    pub async fn sync_now(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.mailbox.send(Mail::SyncNow { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Current local view.
    pub fn snapshot(&self) -> Arc<ActivityIndex> {
        self.changes.borrow().clone()
    }

    /// Notified on every local change.
    pub fn changes(&self) -> watch::Receiver<Arc<ActivityIndex>> {
        self.changes.clone()
    }
}

struct ReplicatorActor {
    node_id: NodeId,
    index: ActivityIndex,
    peers: BTreeMap<NodeId, Arc<dyn GossipPeer>>,
    next_peer: usize,
    next_request: u64,
    changes: watch::Sender<Arc<ActivityIndex>>,
    mailbox: mpsc::WeakUnboundedSender<Mail>,
    gossip_interval: Duration,
    exchange_timeout: Duration,
}

/// Gossip rotations over all peers a tombstone must survive before pruning.
const CONVERGENCE_ROUNDS: u32 = 3;

impl ReplicatorActor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Mail>, gossip_interval: Duration) {
        let mut gossip = interval_at(Instant::now() + gossip_interval, gossip_interval);
        gossip.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                mail = mailbox.recv() => match mail {
                    Some(mail) => self.handle(mail),
                    None => break,
                },
                _ = gossip.tick() => self.gossip_round(),
            }
        }
        log::debug!("Replicator on {} stopped", self.node_id);
    }

    fn handle(&mut self, mail: Mail) {
        match mail {
            Mail::Update {
                summary,
                consistency,
                reply,
            } => {
                self.merge(std::slice::from_ref(&summary));
                match consistency {
                    WriteConsistency::Local => {
                        let _ = reply.send(UpdateOutcome::Success);
                    }
                    WriteConsistency::Majority { timeout } => {
                        self.replicate(summary, timeout, reply);
                    }
                }
            }
            Mail::Prune { cutoff, reply } => {
                let horizon = Timestamp::now().saturating_sub(self.convergence_horizon());
                let cutoff = cutoff.min(horizon);
                let pruned = self.index.prune_tombstones(cutoff);
                if pruned > 0 {
                    log::debug!("Pruned {pruned} tombstones older than {cutoff}");
                    self.notify();
                }
                let _ = reply.send(pruned);
            }
            Mail::Frame { frame, reply } => {
                let _ = reply.send(self.answer(frame));
            }
            Mail::Merge { entries, reply } => {
                self.merge(&entries);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Mail::AddPeer(peer) => {
                log::info!("Replicator {}: peer {} added", self.node_id, peer.node_id());
                self.peers.insert(peer.node_id().clone(), peer);
            }
            Mail::RemovePeer(node_id) => {
                if self.peers.remove(&node_id).is_some() {
                    log::info!("Replicator {}: peer {node_id} removed", self.node_id);
                }
            }
            Mail::SyncNow { reply } => self.sync_all(reply),
        }
    }

    /// How long anti-entropy needs to reach every peer a few times over.
    fn convergence_horizon(&self) -> Duration {
        let rotation = u32::try_from(self.peers.len() + 1).unwrap_or(u32::MAX);
        self.gossip_interval
            .saturating_mul(rotation.saturating_mul(CONVERGENCE_ROUNDS))
            .saturating_add(self.exchange_timeout)
    }

    fn answer(&mut self, frame: GossipFrame) -> Option<GossipFrame> {
        let body = match frame.body {
            GossipBody::Write { entries } => {
                self.merge(&entries);
                GossipBody::WriteAck
            }
            GossipBody::Status { entries } => {
                self.merge(&entries);
                GossipBody::Status {
                    entries: self.index.summaries(),
                }
            }
            GossipBody::WriteAck => {
                log::warn!("Replicator {}: stray WriteAck from {}", self.node_id, frame.from);
                return None;
            }
        };
        Some(GossipFrame {
            from: self.node_id.clone(),
            request_id: frame.request_id,
            body,
        })
    }

    fn merge(&mut self, entries: &[ActivitySummary]) {
        if self.index.merge_entries(entries.iter().cloned()) {
            self.notify();
        }
    }

    fn notify(&self) {
        self.changes.send_replace(Arc::new(self.index.clone()));
    }

    fn frame(&mut self, body: GossipBody) -> GossipFrame {
        self.next_request = self.next_request.wrapping_add(1);
        GossipFrame {
            from: self.node_id.clone(),
            request_id: self.next_request,
            body,
        }
    }

    /// Pushes one write to every peer and waits for `⌊(peers + 1) / 2⌋`
    /// acknowledgements, which with this replica makes a majority.
    fn replicate(
        &mut self,
        summary: ActivitySummary,
        write_timeout: Duration,
        reply: oneshot::Sender<UpdateOutcome>,
    ) {
        let required = (self.peers.len() + 1) / 2;
        if required == 0 {
            let _ = reply.send(UpdateOutcome::Success);
            return;
        }

        let frame = self.frame(GossipBody::Write {
            entries: vec![summary],
        });
        let mut pending: FuturesUnordered<_> =
            self.peers.values().map(|peer| peer.exchange(frame.clone())).collect();
        let deadline = Instant::now() + write_timeout;

        tokio::spawn(async move {
            let mut acks = 0;
            while acks < required {
                match timeout_at(deadline, pending.next()).await {
                    Ok(Some(Ok(GossipFrame {
                        body: GossipBody::WriteAck,
                        ..
                    }))) => acks += 1,
                    Ok(Some(Ok(other))) => {
                        log::warn!("Unexpected answer to Write from {}", other.from);
                    }
                    Ok(Some(Err(e))) => log::debug!("Write replication failed: {e}"),
                    Ok(None) | Err(_) => break,
                }
            }
            let outcome = if acks >= required {
                UpdateOutcome::Success
            } else {
                UpdateOutcome::Timeout { acks, required }
            };
            let _ = reply.send(outcome);
        });
    }

    /// One anti-entropy exchange with the next peer in rotation.
    fn gossip_round(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let index = self.next_peer % self.peers.len();
        self.next_peer = self.next_peer.wrapping_add(1);
        let Some(peer) = self.peers.values().nth(index).cloned() else {
            return;
        };

        let frame = self.frame(GossipBody::Status {
            entries: self.index.summaries(),
        });
        let mailbox = self.mailbox.clone();
        let exchange_timeout = self.exchange_timeout;
        tokio::spawn(async move {
            if let Some(entries) = status_exchange(peer, frame, exchange_timeout).await {
                if let Some(mailbox) = mailbox.upgrade() {
                    let _ = mailbox.send(Mail::Merge {
                        entries,
                        reply: None,
                    });
                }
            }
        });
    }

    fn sync_all(&mut self, reply: oneshot::Sender<usize>) {
        let frame = self.frame(GossipBody::Status {
            entries: self.index.summaries(),
        });
        let exchanges: FuturesUnordered<_> = self
            .peers
            .values()
            .map(|peer| status_exchange(peer.clone(), frame.clone(), self.exchange_timeout))
            .collect();
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let answers: Vec<Vec<ActivitySummary>> =
                exchanges.filter_map(|answer| async move { answer }).collect().await;
            let answered = answers.len();
            let Some(mailbox) = mailbox.upgrade() else {
                return;
            };
            let (done, merged) = oneshot::channel();
            let _ = mailbox.send(Mail::Merge {
                entries: answers.into_iter().flatten().collect(),
                reply: Some(done),
            });
            drop(mailbox);
            let _ = merged.await;
            let _ = reply.send(answered);
        });
    }
}

async fn status_exchange(
    peer: Arc<dyn GossipPeer>,
    frame: GossipFrame,
    exchange_timeout: Duration,
) -> Option<Vec<ActivitySummary>> {
    match timeout(exchange_timeout, peer.exchange(frame)).await {
        Ok(Ok(GossipFrame {
            body: GossipBody::Status { entries },
            ..
        })) => Some(entries),
        Ok(Ok(other)) => {
            log::warn!("Unexpected answer to Status from {}", other.from);
            None
        }
        Ok(Err(e)) => {
            log::debug!("Gossip with {} failed: {e}", peer.node_id());
            None
        }
        Err(_) => {
            log::debug!("Gossip with {} timed out", peer.node_id());
            None
        }
    }
}
