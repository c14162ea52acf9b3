//! Session hosting and routing.
//!
//! Architecture:
//! ```text
//!   SessionRouter ──shard_of(session)──► ShardTable
//!        │                                   │
//!        │ owner == self / unowned           │ owner == other node
//!        ▼                                   ▼
//!   SessionRegion (this node)          dyn ShardTransport ──► SessionRegion (other node)
//!        │
//!        ├── slot "room-1" ── SessionEntity (gen 3)
//!        ├── slot "room-7" ── SessionEntity (gen 1, passivating, 2 buffered)
//!        └── …
//! ```
//!
//! The region is the only place entities are started or stopped. It starts
//! an entity on the first request for its session, buffers requests while
//! an entity is passivating or restarting, and replays the buffer into the
//! next incarnation. A panicking entity is restarted lazily: the next
//! request starts a fresh one, which recovers from the journal.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use scribble_core::{
    shard_for, CommandResult, NodeId, SessionCommand, SessionEvent, SessionId, SessionState,
    ShardError, ShardId, ShardMove, ShardTable, UserId, WireMessage,
};

use crate::config::SessionConfig;
use crate::entity::{
    EntityContext, EntityHandle, PassivationRequest, SessionEntity, SessionRequest, SubscribeAck,
    Subscriber, UnsubscribeAck,
};
use crate::index::PublisherHandle;
use crate::storage::EventJournal;

// ─── Region ─────────────────────────────────────────────────────────

/// Region statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub active_entities: usize,
    pub passivating: usize,
    pub buffered_requests: usize,
    pub started: u64,
    pub crashed: u64,
}

struct Slot {
    generation: u64,
    handle: EntityHandle,
    /// Stop was requested or the entity died; new mail is buffered.
    stopping: bool,
    buffer: Vec<SessionRequest>,
}

enum RegionMail {
    Deliver {
        session_id: SessionId,
        request: SessionRequest,
    },
    Stopped {
        session_id: SessionId,
        generation: u64,
        panicked: bool,
    },
    SetOwnedShards {
        owned: Option<BTreeSet<ShardId>>,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<RegionStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Hosts the session entities of one node.
#[derive(Clone)]
pub struct SessionRegion {
    mailbox: mpsc::UnboundedSender<RegionMail>,
}

impl SessionRegion {
    pub fn spawn(
        journal: Arc<dyn EventJournal>,
        publisher: PublisherHandle,
        config: SessionConfig,
        shard_count: u32,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (passivation_tx, passivation_rx) = mpsc::unbounded_channel();
        let actor = RegionActor {
            slots: HashMap::new(),
            next_generation: 0,
            owned: None,
            shard_count,
            journal,
            publisher,
            config,
            passivation: passivation_tx,
            mailbox: tx.downgrade(),
            stats: RegionStats::default(),
            shutdown: None,
        };
        tokio::spawn(actor.run(rx, passivation_rx));
        Self { mailbox: tx }
    }

    /// Hands a request to the session's entity, starting it if needed.
    /// Returns false once the region has shut down.
    pub fn deliver(&self, session_id: SessionId, request: SessionRequest) -> bool {
        self.mailbox
            .send(RegionMail::Deliver {
                session_id,
                request,
            })
            .is_ok()
    }

    /// Restricts the region to `owned` shards (`None` = all). Entities on
    /// shards no longer owned are stopped. Returns how many were stopped.
    pub async fn set_owned_shards(&self, owned: Option<BTreeSet<ShardId>>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .mailbox
            .send(RegionMail::SetOwnedShards { owned, reply })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn stats(&self) -> RegionStats {
        let (reply, rx) = oneshot::channel();
        if self.mailbox.send(RegionMail::Stats { reply }).is_err() {
            return RegionStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Stops every entity and waits for them to finish.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.mailbox.send(RegionMail::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct RegionActor {
    slots: HashMap<SessionId, Slot>,
    next_generation: u64,
    owned: Option<BTreeSet<ShardId>>,
    shard_count: u32,
    journal: Arc<dyn EventJournal>,
    publisher: PublisherHandle,
    config: SessionConfig,
    passivation: mpsc::UnboundedSender<PassivationRequest>,
    mailbox: mpsc::WeakUnboundedSender<RegionMail>,
    stats: RegionStats,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RegionActor {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<RegionMail>,
        mut passivation: mpsc::UnboundedReceiver<PassivationRequest>,
    ) {
        loop {
            tokio::select! {
                mail = mailbox.recv() => match mail {
                    Some(mail) => self.handle(mail),
                    None => break,
                },
                Some(request) = passivation.recv() => self.passivate(request),
            }
            if self.shutdown.is_some() && self.slots.is_empty() {
                break;
            }
        }
        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(());
        }
        log::debug!("Session region stopped");
    }

    fn handle(&mut self, mail: RegionMail) {
        match mail {
            RegionMail::Deliver {
                session_id,
                request,
            } => self.deliver(session_id, request),
            RegionMail::Stopped {
                session_id,
                generation,
                panicked,
            } => self.on_stopped(session_id, generation, panicked),
            RegionMail::SetOwnedShards { owned, reply } => {
                self.owned = owned;
                let _ = reply.send(self.hand_off());
            }
            RegionMail::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.active_entities = self.slots.len();
                stats.passivating = self.slots.values().filter(|s| s.stopping).count();
                stats.buffered_requests = self.slots.values().map(|s| s.buffer.len()).sum();
                let _ = reply.send(stats);
            }
            RegionMail::Shutdown { reply } => {
                log::info!("Shutting down session region ({} entities)", self.slots.len());
                for slot in self.slots.values_mut() {
                    slot.stopping = true;
                    slot.buffer.clear();
                    slot.handle.stop();
                }
                self.shutdown = Some(reply);
            }
        }
    }

    fn owns(&self, session_id: &SessionId) -> bool {
        self.owned
            .as_ref()
            .is_none_or(|owned| owned.contains(&shard_for(session_id, self.shard_count)))
    }

    fn deliver(&mut self, session_id: SessionId, request: SessionRequest) {
        if self.shutdown.is_some() {
            return;
        }
        if !self.owns(&session_id) {
            log::warn!(
                "Dropping request for {session_id}: {} is not owned here",
                shard_for(&session_id, self.shard_count)
            );
            return;
        }

        match self.slots.get_mut(&session_id) {
            Some(slot) if slot.stopping => slot.buffer.push(request),
            Some(slot) => {
                if let Err(request) = slot.handle.send(request) {
                    // Died without us noticing yet; Stopped is on its way
                    slot.stopping = true;
                    slot.buffer.push(request);
                }
            }
            None => {
                let slot = self.start(session_id.clone());
                if let Err(request) = slot.handle.send(request) {
                    slot.stopping = true;
                    slot.buffer.push(request);
                }
            }
        }
    }

    fn start(&mut self, session_id: SessionId) -> &mut Slot {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (handle, join) = SessionEntity::spawn(EntityContext {
            session_id: session_id.clone(),
            generation,
            journal: self.journal.clone(),
            publisher: self.publisher.clone(),
            passivation: Some(self.passivation.clone()),
            config: self.config.clone(),
        });
        self.stats.started += 1;
        log::debug!("Started session {session_id} (generation {generation})");

        // Monitor: reports termination back to the region
        let mailbox = self.mailbox.clone();
        let monitored = session_id.clone();
        tokio::spawn(async move {
            let panicked = match join.await {
                Ok(()) => false,
                Err(e) => e.is_panic(),
            };
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(RegionMail::Stopped {
                    session_id: monitored,
                    generation,
                    panicked,
                });
            }
        });

        self.slots.entry(session_id).or_insert(Slot {
            generation,
            handle,
            stopping: false,
            buffer: Vec::new(),
        })
    }

    fn passivate(&mut self, request: PassivationRequest) {
        match self.slots.get_mut(&request.session_id) {
            Some(slot) if slot.generation == request.generation && !slot.stopping => {
                log::info!("Passivating session {}", request.session_id);
                slot.stopping = true;
                slot.handle.stop();
            }
            _ => log::debug!("Stale passivation request for {}", request.session_id),
        }
    }

    fn on_stopped(&mut self, session_id: SessionId, generation: u64, panicked: bool) {
        let Some(slot) = self.slots.get(&session_id) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        let Some(slot) = self.slots.remove(&session_id) else {
            return;
        };

        if panicked {
            self.stats.crashed += 1;
            log::error!("Session {session_id} (generation {generation}) crashed; it restarts from the journal");
        } else {
            log::debug!("Session {session_id} (generation {generation}) stopped");
        }

        if slot.buffer.is_empty() || self.shutdown.is_some() || !self.owns(&session_id) {
            return;
        }
        log::debug!(
            "Restarting session {session_id} for {} buffered requests",
            slot.buffer.len()
        );
        for request in slot.buffer {
            self.deliver(session_id.clone(), request);
        }
    }

    /// Stops entities whose shard is no longer owned.
    fn hand_off(&mut self) -> usize {
        let shard_count = self.shard_count;
        let owned = self.owned.clone();
        let mut stopped = 0;
        for (session_id, slot) in self.slots.iter_mut() {
            let keep = owned
                .as_ref()
                .is_none_or(|owned| owned.contains(&shard_for(session_id, shard_count)));
            if keep {
                continue;
            }
            if !slot.buffer.is_empty() {
                log::warn!(
                    "Dropping {} buffered requests for {session_id}: shard handed off",
                    slot.buffer.len()
                );
                slot.buffer.clear();
            }
            if !slot.stopping {
                slot.stopping = true;
                slot.handle.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            log::info!("Handed off {stopped} sessions");
        }
        stopped
    }
}

// ─── Transport ──────────────────────────────────────────────────────

/// Delivers requests to a region on another node.
pub trait ShardTransport: Send + Sync {
    /// Hands the request back if `node` is unreachable.
    fn deliver(
        &self,
        node: &NodeId,
        session_id: SessionId,
        request: SessionRequest,
    ) -> Result<(), SessionRequest>;
}

/// In-process transport between regions of the same process.
#[derive(Default)]
pub struct LoopbackTransport {
    regions: RwLock<HashMap<NodeId, SessionRegion>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, region: SessionRegion) {
        let mut regions = self.regions.write().unwrap_or_else(|p| p.into_inner());
        regions.insert(node, region);
    }

    pub fn unregister(&self, node: &NodeId) {
        let mut regions = self.regions.write().unwrap_or_else(|p| p.into_inner());
        regions.remove(node);
    }
}

impl ShardTransport for LoopbackTransport {
    fn deliver(
        &self,
        node: &NodeId,
        session_id: SessionId,
        request: SessionRequest,
    ) -> Result<(), SessionRequest> {
        let regions = self.regions.read().unwrap_or_else(|p| p.into_inner());
        match regions.get(node) {
            Some(region) => {
                region.deliver(session_id, request);
                Ok(())
            }
            None => Err(request),
        }
    }
}

// ─── Router ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AskError {
    #[error("Session {0} did not answer in time")]
    Timeout(SessionId),

    #[error("Session {0} is unavailable")]
    Unavailable(SessionId),

    #[error("No route to {node} for session {session_id}")]
    Unroutable { node: NodeId, session_id: SessionId },
}

struct RouterInner {
    node_id: NodeId,
    table: RwLock<ShardTable>,
    region: SessionRegion,
    transport: RwLock<Option<Arc<dyn ShardTransport>>>,
    ask_timeout: Duration,
}

/// Sends requests to the session's owner, local or remote, and waits for
/// the answer with a deadline.
#[derive(Clone)]
pub struct SessionRouter {
    inner: Arc<RouterInner>,
}

impl SessionRouter {
    pub fn new(
        node_id: NodeId,
        shard_count: u32,
        region: SessionRegion,
        ask_timeout: Duration,
    ) -> Result<Self, ShardError> {
        Ok(Self {
            inner: Arc::new(RouterInner {
                node_id,
                table: RwLock::new(ShardTable::new(shard_count)?),
                region,
                transport: RwLock::new(None),
                ask_timeout,
            }),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn region(&self) -> &SessionRegion {
        &self.inner.region
    }

    pub fn set_transport(&self, transport: Arc<dyn ShardTransport>) {
        let mut slot = self.inner.transport.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(transport);
    }

    /// Copy of the current shard table.
    pub fn shard_table(&self) -> ShardTable {
        self.inner.table.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Rebalances shards over `nodes` and hands off local sessions whose
    /// shard moved away.
    pub async fn rebalance(&self, nodes: &[NodeId]) -> Result<Vec<ShardMove>, ShardError> {
        let (moves, owned) = {
            let mut table = self.inner.table.write().unwrap_or_else(|p| p.into_inner());
            let moves = table.rebalance(nodes)?;
            let owned: BTreeSet<ShardId> = table.shards_owned_by(&self.inner.node_id).into_iter().collect();
            (moves, owned)
        };
        log::info!(
            "Node {} rebalanced over {} nodes: {} moves, {} shards owned",
            self.inner.node_id,
            nodes.len(),
            moves.len(),
            owned.len()
        );
        self.inner.region.set_owned_shards(Some(owned)).await;
        Ok(moves)
    }

    /// Replaces the table with the uniform placement over `nodes`. Nodes
    /// that agree on the member set compute the same table whatever their
    /// history, so every request for a session reaches one owner.
    pub async fn place(&self, nodes: &[NodeId]) -> Result<Vec<ShardMove>, ShardError> {
        let (moves, owned) = {
            let mut table = self.inner.table.write().unwrap_or_else(|p| p.into_inner());
            let placed = ShardTable::uniform(table.shard_count(), nodes)?;
            let moves: Vec<ShardMove> = (0..placed.shard_count())
                .map(ShardId)
                .filter_map(|shard| {
                    let to = placed.owner(shard)?;
                    let from = table.owner(shard);
                    (from != Some(to)).then(|| ShardMove {
                        shard,
                        from: from.cloned(),
                        to: to.clone(),
                    })
                })
                .collect();
            *table = placed;
            let owned: BTreeSet<ShardId> = table.shards_owned_by(&self.inner.node_id).into_iter().collect();
            (moves, owned)
        };
        log::info!(
            "Node {} placed shards over {} nodes: {} moves, {} shards owned",
            self.inner.node_id,
            nodes.len(),
            moves.len(),
            owned.len()
        );
        self.inner.region.set_owned_shards(Some(owned)).await;
        Ok(moves)
    }

    fn route(&self, session_id: SessionId, request: SessionRequest) -> Result<(), AskError> {
        let owner = {
            let table = self.inner.table.read().unwrap_or_else(|p| p.into_inner());
            table.owner_of(&session_id).cloned()
        };
        match owner {
            Some(node) if node != self.inner.node_id => {
                let transport = self
                    .inner
                    .transport
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                let unroutable = || AskError::Unroutable {
                    node: node.clone(),
                    session_id: session_id.clone(),
                };
                let transport = transport.ok_or_else(unroutable)?;
                transport
                    .deliver(&node, session_id.clone(), request)
                    .map_err(|_| unroutable())
            }
            _ => {
                if self.inner.region.deliver(session_id.clone(), request) {
                    Ok(())
                } else {
                    Err(AskError::Unavailable(session_id))
                }
            }
        }
    }

    async fn ask<T>(
        &self,
        session_id: &SessionId,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, AskError> {
        let (reply, rx) = oneshot::channel();
        self.route(session_id.clone(), make(reply))?;
        match timeout(self.inner.ask_timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(AskError::Unavailable(session_id.clone())),
            Err(_) => Err(AskError::Timeout(session_id.clone())),
        }
    }

    /// Never fails: routing and deadline problems come back as `TimeOut`.
    pub async fn ask_command(&self, command: SessionCommand) -> CommandResult {
        let session_id = command.session_id().clone();
        let name = command.name();
        match self
            .ask(&session_id, |reply| SessionRequest::Command { command, reply })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                log::warn!("{name} for {session_id} failed: {e}");
                CommandResult::timed_out(e.to_string())
            }
        }
    }

    /// Decodes a wire envelope and routes the command inside it. Anything
    /// that is not a command is a `BadRequest`.
    pub async fn ask_encoded(&self, bytes: &[u8]) -> CommandResult {
        match WireMessage::decode(bytes) {
            Ok(WireMessage::Command(command)) => self.ask_command(command).await,
            Ok(other) => CommandResult::bad_request(format!(
                "manifest '{}' is not a command",
                other.manifest()
            )),
            Err(e) => CommandResult::bad_request(e.to_string()),
        }
    }

    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        subscriber_id: Uuid,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<SubscribeAck, AskError> {
        let subscriber = Subscriber {
            id: subscriber_id,
            events,
        };
        self.ask(session_id, |reply| SessionRequest::Subscribe { subscriber, reply })
            .await
    }

    pub async fn unsubscribe(
        &self,
        session_id: &SessionId,
        subscriber_id: Uuid,
    ) -> Result<UnsubscribeAck, AskError> {
        self.ask(session_id, |reply| SessionRequest::Unsubscribe {
            subscriber_id,
            reply,
        })
        .await
    }

    pub async fn get_state(&self, session_id: &SessionId) -> Result<SessionState, AskError> {
        self.ask(session_id, |reply| SessionRequest::GetState { reply }).await
    }

    pub async fn get_users(&self, session_id: &SessionId) -> Result<BTreeSet<UserId>, AskError> {
        self.ask(session_id, |reply| SessionRequest::GetUsers { reply }).await
    }
}
