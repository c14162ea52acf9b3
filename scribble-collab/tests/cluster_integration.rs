//! Multi-node tests: shard handoff between regions, requests routed to the
//! owning node and index gossip over real WebSocket connections.

use scribble_collab::config::{PipelineConfig, ProxyConfig, SessionConfig};
use scribble_collab::index::PublisherHandle;
use scribble_collab::{
    LocalSessionProxy, LoopbackTransport, MemoryJournal, Node, NodeConfig, OutputChannel,
    PaintMessage, PeerConfig, SessionRegion, SessionRouter, WsPeer,
};
use scribble_core::{ActivitySummary, NodeId, SessionEventKind, SessionId, UserId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

const SHARDS: u32 = 50;

fn router(node: &str, journal: Arc<MemoryJournal>) -> SessionRouter {
    let (publisher, _rx) = PublisherHandle::channel();
    let region = SessionRegion::spawn(journal, publisher, SessionConfig::default(), SHARDS);
    SessionRouter::new(NodeId::from(node), SHARDS, region, Duration::from_secs(2)).unwrap()
}

async fn next_kind(channel: &mut OutputChannel) -> SessionEventKind {
    timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("no event within 5s")
        .expect("channel closed")
        .kind
}

async fn wait_for_session(node: &Node, session: &SessionId) -> ActivitySummary {
    wait_for_entry(node, session, false).await
}

/// Waits for any index entry of `session`; tombstones count when `any` is set.
async fn wait_for_entry(node: &Node, session: &SessionId, any: bool) -> ActivitySummary {
    timeout(Duration::from_secs(10), async {
        loop {
            let found = node
                .all_sessions()
                .await
                .into_iter()
                .find(|s| &s.session_id == session && (any || !s.removed));
            if let Some(found) = found {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session never reached the index")
}

/// Waits until `node`'s replica shows `session` live with `users` users.
async fn wait_for_users(node: &Node, session: &SessionId, users: usize) {
    timeout(Duration::from_secs(10), async {
        loop {
            let live = node.active_sessions().await;
            if live.iter().any(|s| &s.session_id == session && s.active_users == users) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("index never showed the expected users")
}

/// Two listening nodes that know each other as cluster members.
async fn peered_pair() -> (Node, Node) {
    let config = |id: &str| NodeConfig {
        gossip_bind: Some("127.0.0.1:0".to_string()),
        ..NodeConfig::for_testing(id)
    };
    let a = Node::start(config("a")).await.unwrap();
    let b = Node::start(config("b")).await.unwrap();
    let peer = |node: &Node| PeerConfig {
        node_id: node.node_id().clone(),
        url: format!("ws://{}", node.gossip_addr().unwrap()),
    };
    a.add_peer(peer(&b)).await.unwrap();
    b.add_peer(peer(&a)).await.unwrap();
    (a, b)
}

fn session_owned_by(node: &Node, owner: &str) -> SessionId {
    let table = node.router().shard_table();
    (0..100)
        .map(|i| SessionId::from(format!("board-{i}")))
        .find(|s| table.owner_of(s) == Some(&NodeId::from(owner)))
        .unwrap()
}

// ─── Shard handoff ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_proxy_follows_session_to_new_owner() {
    let journal = Arc::new(MemoryJournal::new());
    let transport = Arc::new(LoopbackTransport::new());
    let a = router("a", journal.clone());
    let b = router("b", journal.clone());
    transport.register(NodeId::from("a"), a.region().clone());
    transport.register(NodeId::from("b"), b.region().clone());
    a.set_transport(transport.clone());
    b.set_transport(transport.clone());

    let only_a = [NodeId::from("a")];
    a.rebalance(&only_a).await.unwrap();
    b.rebalance(&only_a).await.unwrap();

    // Pick a session that moves to b once b joins
    let both = [NodeId::from("a"), NodeId::from("b")];
    let mut planned = a.shard_table();
    planned.rebalance(&both).unwrap();
    let session = (0..100)
        .map(|i| SessionId::from(format!("board-{i}")))
        .find(|s| planned.owner_of(s) == Some(&NodeId::from("b")))
        .unwrap();

    // The proxy lives on b but the entity starts on a
    let (proxy, _join) = LocalSessionProxy::spawn(
        session.clone(),
        b.clone(),
        ProxyConfig::for_testing(),
        &PipelineConfig::for_testing(),
    );
    let mut channel = proxy.open_channel().await.unwrap();
    while proxy.stats().subscriptions == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    proxy.append(PaintMessage::Join(UserId::from("u1")));
    assert_eq!(
        next_kind(&mut channel).await,
        SessionEventKind::UserAdded(UserId::from("u1"))
    );
    assert_eq!(a.region().stats().await.active_entities, 1);
    assert_eq!(b.region().stats().await.active_entities, 0);

    b.rebalance(&both).await.unwrap();
    a.rebalance(&both).await.unwrap();

    // Handoff ends the old incarnation; the proxy resubscribes to b
    while proxy.stats().subscriptions < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    proxy.append(PaintMessage::Join(UserId::from("u2")));
    assert_eq!(
        next_kind(&mut channel).await,
        SessionEventKind::UserAdded(UserId::from("u2"))
    );

    // The new owner recovered u1 from the shared journal
    let users = b.get_users(&session).await.unwrap();
    assert!(users.contains(&UserId::from("u1")));
    assert!(users.contains(&UserId::from("u2")));
    assert_eq!(b.region().stats().await.active_entities, 1);
    timeout(Duration::from_secs(5), async {
        while a.region().stats().await.active_entities > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old owner kept the entity");
}

// ─── Peered nodes ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peered_nodes_share_one_owner_per_session() {
    let (a, b) = peered_pair().await;
    assert_eq!(a.router().shard_table(), b.router().shard_table());
    assert_eq!(a.members(), b.members());

    let session = SessionId::from("shared-board");
    a.append(&session, PaintMessage::Join(UserId::from("alice"))).await.unwrap();
    b.append(&session, PaintMessage::Join(UserId::from("bob"))).await.unwrap();

    // Both joins land on the one owner, whichever node took them
    let expected: BTreeSet<UserId> = [UserId::from("alice"), UserId::from("bob")].into();
    for node in [&a, &b] {
        timeout(Duration::from_secs(10), async {
            while node.router().get_users(&session).await.ok().as_ref() != Some(&expected) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("users never converged on the owner");
    }
    let hosted = a.region().stats().await.active_entities + b.region().stats().await.active_entities;
    assert_eq!(hosted, 1);

    wait_for_users(&a, &session, 2).await;
    wait_for_users(&b, &session, 2).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_remote_subscription_streams_events() {
    let (a, b) = peered_pair().await;
    let session = session_owned_by(&a, "a");

    let mut channel = b.subscribe(&session).await.unwrap();
    let proxy = b.proxy(&session).await;
    timeout(Duration::from_secs(5), async {
        while proxy.stats().subscriptions == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("proxy never subscribed to the owner");

    a.append(&session, PaintMessage::Join(UserId::from("alice"))).await.unwrap();
    assert_eq!(
        next_kind(&mut channel).await,
        SessionEventKind::UserAdded(UserId::from("alice"))
    );
    b.append(&session, PaintMessage::Join(UserId::from("bob"))).await.unwrap();
    assert_eq!(
        next_kind(&mut channel).await,
        SessionEventKind::UserAdded(UserId::from("bob"))
    );

    assert_eq!(a.region().stats().await.active_entities, 1);
    assert_eq!(b.region().stats().await.active_entities, 0);

    a.shutdown().await;
    b.shutdown().await;
}

// ─── Index gossip ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_index_converges_over_websocket() {
    let config = |id: &str| NodeConfig {
        gossip_bind: Some("127.0.0.1:0".to_string()),
        ..NodeConfig::for_testing(id)
    };
    let a = Node::start(config("a")).await.unwrap();
    let b = Node::start(config("b")).await.unwrap();

    let a_addr = a.gossip_addr().unwrap();
    let b_addr = b.gossip_addr().unwrap();
    a.connect_peer(Arc::new(WsPeer::new(NodeId::from("b"), format!("ws://{b_addr}"))));
    b.connect_peer(Arc::new(WsPeer::new(NodeId::from("a"), format!("ws://{a_addr}"))));

    let on_a = SessionId::from("drawn-on-a");
    let on_b = SessionId::from("drawn-on-b");
    a.append(&on_a, PaintMessage::Join(UserId::from("alice"))).await.unwrap();
    b.append(&on_b, PaintMessage::Join(UserId::from("bob"))).await.unwrap();

    let seen_by_b = wait_for_session(&b, &on_a).await;
    let seen_by_a = wait_for_session(&a, &on_b).await;
    assert_eq!(seen_by_b.active_users, 1);
    assert_eq!(seen_by_a.active_users, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_late_peer_catches_up_through_anti_entropy() {
    let a = Node::start(NodeConfig {
        gossip_bind: Some("127.0.0.1:0".to_string()),
        ..NodeConfig::for_testing("a")
    })
    .await
    .unwrap();

    let session = SessionId::from("early");
    a.append(&session, PaintMessage::Join(UserId::from("alice"))).await.unwrap();
    wait_for_session(&a, &session).await;

    // b connects after the write; only gossip rounds can deliver it
    let b = Node::start(NodeConfig::for_testing("b")).await.unwrap();
    let a_addr = a.gossip_addr().unwrap();
    b.connect_peer(Arc::new(WsPeer::new(NodeId::from("a"), format!("ws://{a_addr}"))));

    // The entry may already be a tombstone if the session went idle
    let seen = wait_for_entry(&b, &session, true).await;
    assert_eq!(seen.session_id, session);

    a.shutdown().await;
    b.shutdown().await;
}
