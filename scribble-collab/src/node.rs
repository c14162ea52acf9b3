//! A scribble node: every runtime component of one process, wired together.
//!
//! ```text
//!   append / subscribe ──► ProxyRegistry ──► LocalSessionProxy ──► SessionRouter ──► SessionRegion
//!                                                                                      │
//!   active_sessions   ◄── IndexReader ◄── Replicator ◄── ActivityPublisher ◄───────────┘
//!                                            ▲
//!                              GossipServer ─┘── WsPeer ──► other nodes
//! ```
//!
//! Shards are placed uniformly over the node and its peers. Requests for
//! sessions owned elsewhere leave through a [`WsShardTransport`] and reach
//! the owner's region through its gossip listener.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use scribble_core::{ActivitySummary, NodeId, SessionId, ShardError, ShardMove};

use crate::config::{ConfigError, NodeConfig, PeerConfig};
use crate::index::{
    ActivityPublisher, GossipPeer, GossipServer, IndexReader, IndexSubscription, Replicator,
    WsPeer,
};
use crate::proxy::{OutputChannel, PaintMessage, ProxyHandle, ProxyRegistry};
use crate::region::{SessionRegion, SessionRouter};
use crate::remote::WsShardTransport;
use crate::storage::{EventJournal, MemoryJournal, RocksJournal, StoreConfig, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    #[error("Gossip listener error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy for session {0} has shut down")]
    ProxyClosed(SessionId),
}

pub struct Node {
    config: NodeConfig,
    replicator: Replicator,
    reader: IndexReader,
    router: SessionRouter,
    shards: Arc<WsShardTransport>,
    /// This node and every peer; shards are placed over exactly this set.
    members: Mutex<BTreeSet<NodeId>>,
    proxies: ProxyRegistry,
    gossip_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Starts a node with the journal its configuration asks for:
    /// RocksDB under `storage_path`, in memory otherwise.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let journal: Arc<dyn EventJournal> = match &config.storage_path {
            Some(path) => Arc::new(RocksJournal::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryJournal::new()),
        };
        Self::with_journal(config, journal).await
    }

    pub async fn with_journal(config: NodeConfig, journal: Arc<dyn EventJournal>) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id.clone();
        log::info!(
            "Starting node {node_id} ({} shards, {} peers, storage: {})",
            config.shard_count,
            config.peers.len(),
            config
                .storage_path
                .as_ref()
                .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
        );

        let replicator = Replicator::spawn(
            node_id.clone(),
            config.index.gossip_interval,
            config.index.write_timeout,
        );
        let (publisher, publisher_task) = ActivityPublisher::spawn(replicator.clone(), &config.index);
        let reader = IndexReader::spawn(&replicator, config.index.publish_interval);

        let region = SessionRegion::spawn(journal, publisher, config.session.clone(), config.shard_count);
        let router = SessionRouter::new(
            node_id.clone(),
            config.shard_count,
            region,
            config.pipeline.command_timeout,
        )?;
        let shards = Arc::new(WsShardTransport::new());
        router.set_transport(shards.clone());

        let mut members = BTreeSet::from([node_id.clone()]);
        for peer in &config.peers {
            replicator.add_peer(Arc::new(WsPeer::new(peer.node_id.clone(), peer.url.clone())));
            shards.add_route(peer.node_id.clone(), &peer.url);
            members.insert(peer.node_id.clone());
        }
        router.place(&members.iter().cloned().collect::<Vec<_>>()).await?;
        let proxies = ProxyRegistry::new(router.clone(), config.proxy.clone(), config.pipeline.clone());

        let mut tasks = vec![publisher_task];
        let mut gossip_addr = None;
        if let Some(bind) = &config.gossip_bind {
            let server = GossipServer::bind(bind, replicator.clone())
                .await?
                .with_region(router.region().clone());
            gossip_addr = Some(server.local_addr()?);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    log::error!("Gossip server stopped: {e}");
                }
            }));
        }

        Ok(Self {
            config,
            replicator,
            reader,
            router,
            shards,
            members: Mutex::new(members),
            proxies,
            gossip_addr,
            tasks,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Client boundary: one paint message for a session.
    pub async fn append(&self, session_id: &SessionId, message: PaintMessage) -> Result<(), NodeError> {
        let proxy = self.proxies.get_or_create(session_id).await;
        if proxy.append(message) {
            Ok(())
        } else {
            Err(NodeError::ProxyClosed(session_id.clone()))
        }
    }

    /// Client boundary: a new event stream for a session.
    pub async fn subscribe(&self, session_id: &SessionId) -> Result<OutputChannel, NodeError> {
        let proxy = self.proxies.get_or_create(session_id).await;
        proxy
            .open_channel()
            .await
            .ok_or_else(|| NodeError::ProxyClosed(session_id.clone()))
    }

    /// This node's proxy for `session_id`, started on first use.
    pub async fn proxy(&self, session_id: &SessionId) -> ProxyHandle {
        self.proxies.get_or_create(session_id).await
    }

    /// Live sessions known to this node's index replica.
    pub async fn active_sessions(&self) -> Vec<ActivitySummary> {
        self.reader.active().await
    }

    /// Every index entry, tombstones included.
    pub async fn all_sessions(&self) -> Vec<ActivitySummary> {
        self.reader.all().await
    }

    pub fn watch_sessions(&self) -> IndexSubscription {
        self.reader.subscribe()
    }

    /// Adds an index-only gossip peer. Shard placement is unchanged, so the
    /// peer's sessions are never routed here nor ours there.
    pub fn connect_peer(&self, peer: Arc<dyn GossipPeer>) {
        self.replicator.add_peer(peer);
    }

    /// Adds a cluster member at runtime: its index replica becomes a gossip
    /// peer and shards are placed again over the grown member set. Local
    /// sessions on shards that moved to `peer` are handed off.
    pub async fn add_peer(&self, peer: PeerConfig) -> Result<Vec<ShardMove>, NodeError> {
        if peer.node_id == self.config.node_id {
            return Err(ConfigError::Invalid(format!(
                "node {} cannot peer with itself",
                peer.node_id
            ))
            .into());
        }
        self.replicator
            .add_peer(Arc::new(WsPeer::new(peer.node_id.clone(), peer.url.clone())));
        self.shards.add_route(peer.node_id.clone(), &peer.url);
        let members: Vec<NodeId> = {
            let mut members = self.members.lock().unwrap_or_else(|p| p.into_inner());
            members.insert(peer.node_id.clone());
            members.iter().cloned().collect()
        };
        log::info!("Node {} added peer {} at {}", self.config.node_id, peer.node_id, peer.url);
        Ok(self.router.place(&members).await?)
    }

    /// This node and its peers.
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.members.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    pub fn region(&self) -> &SessionRegion {
        self.router.region()
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.gossip_addr
    }

    /// Stops proxies, then entities, then background tasks.
    pub async fn shutdown(self) {
        log::info!("Shutting down node {}", self.config.node_id);
        self.proxies.shutdown().await;
        self.router.region().shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
    }
}
