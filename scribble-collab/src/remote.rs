//! WebSocket shard transport: requests for sessions owned by another node
//! travel to that node's region, and subscribed events stream back.
//!
//! ```text
//!   SessionRouter ──deliver──► WsShardTransport ──► link task (one per node)
//!                                                        │ ws://peer/shards
//!                                                        ▼
//!                         GossipServer ──"/shards"──► serve_shards ──► SessionRegion
//!                                                        │
//!   Subscriber ◄── Event / Ended ◄───────────────────────┘
//! ```
//!
//! Requests are manifest-tagged [`Envelope`]s, the same shapes the codec
//! defines for commands and queries. A link writes requests in the order
//! they were delivered, so a session's commands keep their order across
//! the hop. A remote subscription ends when the owner reports its entity
//! gone or the connection drops; either way the subscriber's lifeline
//! terminates and the proxy resubscribes through the router.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use scribble_core::{
    CommandResult, Envelope, NodeId, ProtocolError, SessionEvent, SessionId, SessionState, UserId,
    WireMessage,
};

use crate::entity::{Lifeline, SessionRequest, SubscribeAck, Subscriber, UnsubscribeAck};
use crate::region::{SessionRegion, ShardTransport};

/// Path of the shard endpoint, served next to gossip.
pub const SHARD_PATH: &str = "/shards";

/// Shard endpoint of the node whose gossip endpoint is `base`.
pub fn shard_url(base: &str) -> String {
    format!("{}{SHARD_PATH}", base.trim_end_matches('/'))
}

// ─── Frames ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardFrame {
    Request { request_id: u64, envelope: Envelope },
    Reply { request_id: u64, reply: ShardReply },
    Event { subscriber: Uuid, event: SessionEvent },
    /// The entity behind a subscription has stopped.
    Ended { subscriber: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardReply {
    Command(CommandResult),
    State(SessionState),
    Users(BTreeSet<UserId>),
    Subscribed,
    Unsubscribed,
    /// The owner could not answer.
    Unavailable(String),
}

impl ShardFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

// ─── Client ─────────────────────────────────────────────────────────

type Routed = (SessionId, SessionRequest);

/// Routes requests to other nodes, one lazily connected link per node.
#[derive(Default)]
pub struct WsShardTransport {
    links: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Routed>>>,
}

impl WsShardTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `node`'s requests to the node serving gossip at `url`.
    /// Replaces any earlier route to `node`.
    pub fn add_route(&self, node: NodeId, url: &str) {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(node.clone(), shard_url(url), rx));
        let mut links = self.links.write().unwrap_or_else(|p| p.into_inner());
        links.insert(node, tx);
    }

    pub fn remove_route(&self, node: &NodeId) {
        let mut links = self.links.write().unwrap_or_else(|p| p.into_inner());
        links.remove(node);
    }

    pub fn routes(&self) -> usize {
        self.links.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl ShardTransport for WsShardTransport {
    fn deliver(
        &self,
        node: &NodeId,
        session_id: SessionId,
        request: SessionRequest,
    ) -> Result<(), SessionRequest> {
        let links = self.links.read().unwrap_or_else(|p| p.into_inner());
        match links.get(node) {
            Some(link) => link
                .send((session_id, request))
                .map_err(|mpsc::error::SendError((_, request))| request),
            None => Err(request),
        }
    }
}

/// Connects on the first request and again after every disconnect. A
/// request that cannot be sent is dropped, which its caller sees as an
/// unavailable session.
async fn run_link(node: NodeId, url: String, mut requests: mpsc::UnboundedReceiver<Routed>) {
    while let Some(first) = requests.recv().await {
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Cannot reach shard owner {node} at {url}: {e}");
                continue;
            }
        };
        log::info!("Shard link to {node} at {url} open");

        let mut link = Link::default();
        if let Err(e) = link.run(ws, first, &mut requests).await {
            log::warn!("Shard link to {node} failed: {e}");
        }
        log::info!(
            "Shard link to {node} closed ({} pending, {} subscriptions ended)",
            link.pending.len(),
            link.subscriptions.len()
        );
    }
}

enum Pending {
    Command(oneshot::Sender<CommandResult>),
    State(oneshot::Sender<SessionState>),
    Users(oneshot::Sender<BTreeSet<UserId>>),
    Subscribe {
        session_id: SessionId,
        subscriber: Subscriber,
        reply: oneshot::Sender<SubscribeAck>,
    },
    Unsubscribe {
        session_id: SessionId,
        subscriber: Uuid,
        reply: oneshot::Sender<UnsubscribeAck>,
    },
}

struct RemoteSubscription {
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Dropping it ends the subscriber's lifeline.
    _alive: watch::Sender<()>,
}

/// One connection's worth of state. Dropping it fails every pending
/// request and ends every subscription.
#[derive(Default)]
struct Link {
    next_request: u64,
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<Uuid, RemoteSubscription>,
}

impl Link {
    async fn run(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        first: Routed,
        requests: &mut mpsc::UnboundedReceiver<Routed>,
    ) -> Result<(), tungstenite::Error> {
        let (mut writer, mut reader) = ws.split();
        let (session_id, request) = first;
        if let Some(bytes) = self.outgoing(session_id, request) {
            writer.send(Message::Binary(bytes.into())).await?;
        }

        loop {
            tokio::select! {
                routed = requests.recv() => {
                    let Some((session_id, request)) = routed else { break };
                    if let Some(bytes) = self.outgoing(session_id, request) {
                        writer.send(Message::Binary(bytes.into())).await?;
                    }
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(bytes) = self.incoming(&data) {
                            writer.send(Message::Binary(bytes.into())).await?;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        writer.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                },
            }
        }
        let _ = writer.close().await;
        Ok(())
    }

    /// Registers the request's reply slot and encodes it.
    fn outgoing(&mut self, session_id: SessionId, request: SessionRequest) -> Option<Vec<u8>> {
        let (message, pending) = match request {
            SessionRequest::Command { command, reply } => {
                (WireMessage::Command(command), Pending::Command(reply))
            }
            SessionRequest::GetState { reply } => (
                WireMessage::GetState {
                    session_id: session_id.clone(),
                },
                Pending::State(reply),
            ),
            SessionRequest::GetUsers { reply } => (
                WireMessage::GetUsers {
                    session_id: session_id.clone(),
                },
                Pending::Users(reply),
            ),
            SessionRequest::Subscribe { subscriber, reply } => (
                WireMessage::Subscribe {
                    session_id: session_id.clone(),
                    subscriber: subscriber.id,
                },
                Pending::Subscribe {
                    session_id,
                    subscriber,
                    reply,
                },
            ),
            SessionRequest::Unsubscribe {
                subscriber_id,
                reply,
            } => (
                WireMessage::Unsubscribe {
                    session_id: session_id.clone(),
                    subscriber: subscriber_id,
                },
                Pending::Unsubscribe {
                    session_id,
                    subscriber: subscriber_id,
                    reply,
                },
            ),
        };

        let request_id = self.next_request_id();
        let bytes = self.encode_request(request_id, &message)?;
        self.pending.insert(request_id, pending);
        Some(bytes)
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_request = self.next_request.wrapping_add(1);
        self.next_request
    }

    fn encode_request(&self, request_id: u64, message: &WireMessage) -> Option<Vec<u8>> {
        let encoded = message.to_envelope().and_then(|envelope| {
            ShardFrame::Request {
                request_id,
                envelope,
            }
            .encode()
        });
        match encoded {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!(
                    "Failed to encode {} for {}: {e}",
                    message.manifest(),
                    message.session_id()
                );
                None
            }
        }
    }

    /// Handles one frame from the owner. Returns a frame to send back, if any.
    fn incoming(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let frame = match ShardFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping undecodable shard frame: {e}");
                return None;
            }
        };
        match frame {
            ShardFrame::Reply { request_id, reply } => {
                if let Some(pending) = self.pending.remove(&request_id) {
                    self.complete(pending, reply);
                }
                None
            }
            ShardFrame::Event { subscriber, event } => {
                let session_id = event.session_id.clone();
                let delivered = self
                    .subscriptions
                    .get(&subscriber)
                    .is_some_and(|s| s.events.send(event).is_ok());
                if delivered || self.subscriptions.remove(&subscriber).is_none() {
                    return None;
                }
                // The local receiver is gone; release the owner's side too
                log::debug!("Remote subscriber {subscriber} for {session_id} gone");
                let message = WireMessage::Unsubscribe {
                    session_id,
                    subscriber,
                };
                let request_id = self.next_request_id();
                self.encode_request(request_id, &message)
            }
            ShardFrame::Ended { subscriber } => {
                self.subscriptions.remove(&subscriber);
                None
            }
            ShardFrame::Request { request_id, .. } => {
                log::warn!("Shard owner sent request {request_id} on a client link");
                None
            }
        }
    }

    fn complete(&mut self, pending: Pending, reply: ShardReply) {
        match (pending, reply) {
            (Pending::Command(tx), ShardReply::Command(result)) => {
                let _ = tx.send(result);
            }
            (Pending::State(tx), ShardReply::State(state)) => {
                let _ = tx.send(state);
            }
            (Pending::Users(tx), ShardReply::Users(users)) => {
                let _ = tx.send(users);
            }
            (
                Pending::Subscribe {
                    session_id,
                    subscriber,
                    reply,
                },
                ShardReply::Subscribed,
            ) => {
                let (alive, lifeline) = watch::channel(());
                self.subscriptions.insert(
                    subscriber.id,
                    RemoteSubscription {
                        events: subscriber.events,
                        _alive: alive,
                    },
                );
                let _ = reply.send(SubscribeAck {
                    session_id,
                    lifeline: Lifeline::from_watch(lifeline),
                });
            }
            (
                Pending::Unsubscribe {
                    session_id,
                    subscriber,
                    reply,
                },
                ShardReply::Unsubscribed,
            ) => {
                self.subscriptions.remove(&subscriber);
                let _ = reply.send(UnsubscribeAck { session_id });
            }
            (_, ShardReply::Unavailable(reason)) => {
                log::debug!("Shard owner could not answer: {reason}");
            }
            (_, other) => log::warn!("Shard reply does not match its request: {other:?}"),
        }
    }
}

// ─── Server ─────────────────────────────────────────────────────────

/// Serves one shard connection: requests go into `region`, answers and
/// subscribed events go back.
pub(crate) async fn serve_shards(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    region: SessionRegion,
) -> Result<(), tungstenite::Error> {
    let (mut writer, mut reader) = ws.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ShardFrame>();
    log::debug!("Shard connection from {addr}");

    loop {
        tokio::select! {
            msg = reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => match ShardFrame::decode(&data) {
                    Ok(ShardFrame::Request { request_id, envelope }) => {
                        handle_request(&region, request_id, &envelope, &frames_tx);
                    }
                    Ok(other) => log::warn!("Unexpected shard frame from {addr}: {other:?}"),
                    Err(e) => log::warn!("Dropping undecodable shard frame from {addr}: {e}"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    writer.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            },
            Some(frame) = frames_rx.recv() => match frame.encode() {
                Ok(bytes) => writer.send(Message::Binary(bytes.into())).await?,
                Err(e) => log::error!("Failed to encode shard frame for {addr}: {e}"),
            },
        }
    }
    log::debug!("Shard connection from {addr} closed");
    Ok(())
}

fn handle_request(
    region: &SessionRegion,
    request_id: u64,
    envelope: &Envelope,
    frames: &mpsc::UnboundedSender<ShardFrame>,
) {
    let message = match envelope.open() {
        Ok(message) => message,
        Err(e) => {
            let _ = frames.send(ShardFrame::Reply {
                request_id,
                reply: ShardReply::Unavailable(e.to_string()),
            });
            return;
        }
    };
    let session_id = message.session_id().clone();
    let frames = frames.clone();

    match message {
        WireMessage::Command(command) => {
            let (reply, rx) = oneshot::channel();
            region.deliver(session_id, SessionRequest::Command { command, reply });
            tokio::spawn(answer(rx, frames, request_id, ShardReply::Command));
        }
        WireMessage::GetState { .. } => {
            let (reply, rx) = oneshot::channel();
            region.deliver(session_id, SessionRequest::GetState { reply });
            tokio::spawn(answer(rx, frames, request_id, ShardReply::State));
        }
        WireMessage::GetUsers { .. } => {
            let (reply, rx) = oneshot::channel();
            region.deliver(session_id, SessionRequest::GetUsers { reply });
            tokio::spawn(answer(rx, frames, request_id, ShardReply::Users));
        }
        WireMessage::Subscribe { subscriber, .. } => {
            let (events, events_rx) = mpsc::unbounded_channel();
            let (reply, rx) = oneshot::channel();
            region.deliver(
                session_id,
                SessionRequest::Subscribe {
                    subscriber: Subscriber {
                        id: subscriber,
                        events,
                    },
                    reply,
                },
            );
            tokio::spawn(forward_subscription(rx, events_rx, frames, request_id, subscriber));
        }
        WireMessage::Unsubscribe { subscriber, .. } => {
            let (reply, rx) = oneshot::channel();
            region.deliver(
                session_id,
                SessionRequest::Unsubscribe {
                    subscriber_id: subscriber,
                    reply,
                },
            );
            tokio::spawn(answer(rx, frames, request_id, |_| ShardReply::Unsubscribed));
        }
        other => {
            let _ = frames.send(ShardFrame::Reply {
                request_id,
                reply: ShardReply::Unavailable(format!(
                    "manifest '{}' is not a request",
                    other.manifest()
                )),
            });
        }
    }
}

async fn answer<T>(
    rx: oneshot::Receiver<T>,
    frames: mpsc::UnboundedSender<ShardFrame>,
    request_id: u64,
    wrap: fn(T) -> ShardReply,
) {
    let reply = match rx.await {
        Ok(value) => wrap(value),
        Err(_) => ShardReply::Unavailable("session stopped before answering".into()),
    };
    let _ = frames.send(ShardFrame::Reply { request_id, reply });
}

/// Acknowledges a remote subscribe, then forwards events until the entity
/// stops or the connection closes.
async fn forward_subscription(
    ack: oneshot::Receiver<SubscribeAck>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    frames: mpsc::UnboundedSender<ShardFrame>,
    request_id: u64,
    subscriber: Uuid,
) {
    let Ok(ack) = ack.await else {
        let _ = frames.send(ShardFrame::Reply {
            request_id,
            reply: ShardReply::Unavailable("subscribe was not acknowledged".into()),
        });
        return;
    };
    let reply = ShardFrame::Reply {
        request_id,
        reply: ShardReply::Subscribed,
    };
    if frames.send(reply).is_err() {
        return;
    }

    let mut lifeline = ack.lifeline;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => {
                    if frames.send(ShardFrame::Event { subscriber, event }).is_err() {
                        return;
                    }
                }
                None => break,
            },
            _ = lifeline.terminated() => break,
            _ = frames.closed() => return,
        }
    }
    let _ = frames.send(ShardFrame::Ended { subscriber });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::index::{GossipServer, PublisherHandle, Replicator};
    use crate::region::{AskError, SessionRouter};
    use crate::storage::MemoryJournal;
    use scribble_core::{ResultCode, SessionCommand, SessionEventKind};
    use std::sync::Arc;
    use std::time::Duration;

    const SHARDS: u32 = 8;

    /// Node "a" hosting every shard behind a real listener.
    async fn owner() -> (SessionRegion, String) {
        let (publisher, _rx) = PublisherHandle::channel();
        let region = SessionRegion::spawn(
            Arc::new(MemoryJournal::new()),
            publisher,
            SessionConfig::default(),
            SHARDS,
        );
        let replicator = Replicator::spawn(
            NodeId::from("a"),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let server = GossipServer::bind("127.0.0.1:0", replicator)
            .await
            .unwrap()
            .with_region(region.clone());
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());
        (region, url)
    }

    /// Node "b" that hosts nothing and routes everything to "a".
    async fn client(url: &str) -> SessionRouter {
        let (publisher, _rx) = PublisherHandle::channel();
        let region = SessionRegion::spawn(
            Arc::new(MemoryJournal::new()),
            publisher,
            SessionConfig::default(),
            SHARDS,
        );
        let router =
            SessionRouter::new(NodeId::from("b"), SHARDS, region, Duration::from_secs(2)).unwrap();
        let transport = Arc::new(WsShardTransport::new());
        transport.add_route(NodeId::from("a"), url);
        router.set_transport(transport);
        router.place(&[NodeId::from("a")]).await.unwrap();
        router
    }

    fn add_user(user: &str) -> SessionCommand {
        SessionCommand::AddUser {
            session_id: SessionId::from("s1"),
            user_id: UserId::from(user),
        }
    }

    #[test]
    fn test_shard_url_appends_path() {
        assert_eq!(shard_url("ws://10.0.0.2:7400"), "ws://10.0.0.2:7400/shards");
        assert_eq!(shard_url("ws://10.0.0.2:7400/"), "ws://10.0.0.2:7400/shards");
    }

    #[tokio::test]
    async fn test_commands_and_queries_reach_remote_owner() {
        let (region, url) = owner().await;
        let b = client(&url).await;

        assert_eq!(b.ask_command(add_user("u1")).await.code, ResultCode::Ok);
        assert_eq!(b.ask_command(add_user("u1")).await.code, ResultCode::NoOp);
        assert_eq!(b.ask_command(add_user("u2")).await.code, ResultCode::Ok);

        let users = b.get_users(&SessionId::from("s1")).await.unwrap();
        assert_eq!(users.len(), 2);
        let state = b.get_state(&SessionId::from("s1")).await.unwrap();
        assert_eq!(state.connected_users, users);

        assert_eq!(region.stats().await.active_entities, 1);
        assert_eq!(b.region().stats().await.active_entities, 0);
    }

    #[tokio::test]
    async fn test_remote_subscription_streams_until_entity_stops() {
        let (region, url) = owner().await;
        let b = client(&url).await;

        let (events, mut rx) = mpsc::unbounded_channel();
        let ack = b
            .subscribe(&SessionId::from("s1"), Uuid::new_v4(), events)
            .await
            .unwrap();
        assert_eq!(ack.session_id, SessionId::from("s1"));

        b.ask_command(add_user("u1")).await;
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, SessionEventKind::UserAdded(UserId::from("u1")));

        // The owner stops the entity; the remote lifeline follows
        region.set_owned_shards(Some(BTreeSet::new())).await;
        let mut lifeline = ack.lifeline;
        tokio::time::timeout(Duration::from_secs(2), lifeline.terminated())
            .await
            .unwrap();
        assert!(lifeline.is_terminated());
    }

    #[tokio::test]
    async fn test_unreachable_owner_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let b = client(&format!("ws://{addr}")).await;
        let result = b.get_users(&SessionId::from("s1")).await;
        assert_eq!(result, Err(AskError::Unavailable(SessionId::from("s1"))));
        let command = b.ask_command(add_user("u1")).await;
        assert_eq!(command.code, ResultCode::TimeOut);
    }

    #[test]
    fn test_frame_codec() {
        let frame = ShardFrame::Reply {
            request_id: 3,
            reply: ShardReply::Command(CommandResult::ok()),
        };
        assert_eq!(ShardFrame::decode(&frame.encode().unwrap()).unwrap(), frame);
        assert!(ShardFrame::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
