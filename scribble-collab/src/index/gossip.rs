//! WebSocket transport for index replication.
//!
//! Every node runs a [`GossipServer`] and dials each configured peer through
//! a [`WsPeer`]. One binary WebSocket message carries one bincode-encoded
//! [`GossipFrame`]; answers are matched to requests by `request_id`, so a
//! single connection carries any number of concurrent exchanges.
//!
//! ```text
//!   WsPeer ──connect_async──► GossipServer ──► Replicator::handle_frame
//!     ▲                              │
//!     └───────── answer frame ◄──────┘
//! ```
//!
//! The same listener serves shard traffic on [`SHARD_PATH`] once a region
//! is attached with [`GossipServer::with_region`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use scribble_core::NodeId;

use super::replicator::{GossipError, GossipFrame, GossipPeer, Replicator};
use crate::region::SessionRegion;
use crate::remote::{serve_shards, SHARD_PATH};

// ─── Server ─────────────────────────────────────────────────────────

/// Accepts peer connections and answers their frames from the local replicator.
pub struct GossipServer {
    listener: TcpListener,
    replicator: Replicator,
    region: Option<SessionRegion>,
}

impl GossipServer {
    pub async fn bind(addr: &str, replicator: Replicator) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            replicator,
            region: None,
        })
    }

    /// Also answers shard requests for `region`.
    pub fn with_region(mut self, region: SessionRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        log::info!(
            "Gossip server for {} listening on {}",
            self.replicator.node_id(),
            self.listener.local_addr()?
        );
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New gossip connection from {addr}");

            let replicator = self.replicator.clone();
            let region = self.region.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, replicator, region).await {
                    log::warn!("Gossip connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        replicator: Replicator,
        region: Option<SessionRegion>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut path = String::new();
        let record_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };
        let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, record_path).await?;

        if path == SHARD_PATH {
            return match region {
                Some(region) => Ok(serve_shards(ws_stream, addr, region).await?),
                None => {
                    log::warn!("Shard connection from {addr} refused: no sessions hosted here");
                    ws_stream.close(None).await?;
                    Ok(())
                }
            };
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Frames are answered concurrently; the writer is shared via a channel.
        let (answers_tx, mut answers_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match GossipFrame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Dropping undecodable gossip frame from {addr}: {e}");
                                continue;
                            }
                        };
                        let replicator = replicator.clone();
                        let answers = answers_tx.clone();
                        tokio::spawn(async move {
                            if let Some(answer) = replicator.handle_frame(frame).await {
                                match answer.encode() {
                                    Ok(bytes) => {
                                        let _ = answers.send(bytes);
                                    }
                                    Err(e) => log::error!("Failed to encode gossip answer: {e}"),
                                }
                            }
                        });
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws_sender.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(bytes) = answers_rx.recv() => {
                    ws_sender.send(Message::Binary(bytes.into())).await?;
                }
            }
        }

        log::debug!("Gossip connection from {addr} closed");
        Ok(())
    }
}

// ─── Client ─────────────────────────────────────────────────────────

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<GossipFrame>>>>;

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    alive: Arc<AtomicBool>,
}

struct WsPeerInner {
    node_id: NodeId,
    url: String,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

/// Remote replica reached over WebSocket. Connects lazily and reconnects on
/// the next exchange after the connection drops.
#[derive(Clone)]
pub struct WsPeer {
    inner: Arc<WsPeerInner>,
}

impl WsPeer {
    pub fn new(node_id: NodeId, url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WsPeerInner {
                node_id,
                url: url.into(),
                connection: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl WsPeerInner {
    async fn request(&self, frame: GossipFrame) -> Result<GossipFrame, GossipError> {
        let bytes = frame.encode()?;
        let (reply, answer) = oneshot::channel();
        {
            let mut guard = self.connection.lock().await;
            let reusable = guard
                .as_ref()
                .is_some_and(|conn| conn.alive.load(Ordering::Acquire));
            if !reusable {
                *guard = Some(self.connect().await?);
            }
            let conn = guard.as_ref().ok_or(GossipError::Closed)?;
            lock_pending(&conn.pending).insert(frame.request_id, reply);
            if conn.outgoing.send(Message::Binary(bytes.into())).is_err() {
                lock_pending(&conn.pending).remove(&frame.request_id);
                conn.alive.store(false, Ordering::Release);
                return Err(GossipError::Closed);
            }
        }
        answer.await.map_err(|_| GossipError::Closed)
    }

    async fn connect(&self) -> Result<Connection, GossipError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| GossipError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        log::info!("Connected to gossip peer {} at {}", self.node_id, self.url);
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        let writer_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::Release);
            let _ = ws_writer.close().await;
        });

        // Reader task: route answers to waiting requests
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        let peer = self.node_id.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_reader.next().await {
                match msg {
                    Message::Binary(data) => match GossipFrame::decode(&data) {
                        Ok(frame) => {
                            if let Some(waiter) = lock_pending(&reader_pending).remove(&frame.request_id) {
                                let _ = waiter.send(frame);
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from {peer}: {e}"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            reader_alive.store(false, Ordering::Release);
            // Fails everyone still waiting
            lock_pending(&reader_pending).clear();
            log::info!("Gossip connection to {peer} closed");
        });

        Ok(Connection {
            outgoing,
            pending,
            alive,
        })
    }
}

fn lock_pending(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<GossipFrame>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GossipPeer for WsPeer {
    fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    fn exchange(&self, frame: GossipFrame) -> BoxFuture<'static, Result<GossipFrame, GossipError>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.request(frame).await })
    }
}
