//! End-to-end tests through a single node's client boundary.
//!
//! Verifies:
//! - Lifecycle messages and drawn points reach every output channel
//! - The activity index reflects joins and passivation
//! - Index subscribers see changes without polling

use scribble_collab::{Node, NodeConfig, OutputChannel, PaintMessage, StrokeInput};
use scribble_core::{Color, Point, SessionEventKind, SessionId, StrokeWidth, UserId};
use std::time::Duration;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start_node() -> Node {
    Node::start(NodeConfig::for_testing("node-a")).await.unwrap()
}

/// Opens a channel and waits until the proxy holds an upstream subscription.
async fn subscribed_channel(node: &Node, session: &SessionId) -> OutputChannel {
    let channel = node.subscribe(session).await.unwrap();
    let proxy = node.proxy(session).await;
    timeout(Duration::from_secs(5), async {
        while proxy.stats().subscriptions == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("proxy never subscribed");
    channel
}

async fn next_kind(channel: &mut OutputChannel) -> SessionEventKind {
    timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("no event within 5s")
        .expect("channel closed")
        .kind
}

fn point(user: &str, x: f64, y: f64) -> PaintMessage {
    PaintMessage::Stroke(StrokeInput::AddPoint {
        user_id: UserId::from(user),
        point: Point::new(x, y),
        width: StrokeWidth::new(4).unwrap(),
        color: Color::new("#ff0000"),
    })
}

// ─── Drawing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_drawing_session() {
    let node = start_node().await;
    let session = SessionId::from("board-1");
    let mut alice_view = subscribed_channel(&node, &session).await;
    let mut bob_view = node.subscribe(&session).await.unwrap();

    node.append(&session, PaintMessage::Join(UserId::from("alice"))).await.unwrap();
    assert_eq!(
        next_kind(&mut alice_view).await,
        SessionEventKind::UserAdded(UserId::from("alice"))
    );

    for i in 0..5 {
        node.append(&session, point("alice", f64::from(i), 0.0)).await.unwrap();
    }
    node.append(&session, PaintMessage::Stroke(StrokeInput::StrokeCompleted {
        user_id: UserId::from("alice"),
    }))
    .await
    .unwrap();

    let mut drawn = 0;
    loop {
        match next_kind(&mut alice_view).await {
            SessionEventKind::StrokeAdded(stroke) => {
                assert_eq!(stroke.width, StrokeWidth::new(4).unwrap());
                drawn += stroke.point_count();
                if drawn == 5 {
                    break;
                }
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    node.append(&session, PaintMessage::Clear).await.unwrap();
    assert_eq!(next_kind(&mut alice_view).await, SessionEventKind::StrokesCleared);

    node.append(&session, PaintMessage::Leave(UserId::from("alice"))).await.unwrap();
    assert_eq!(
        next_kind(&mut alice_view).await,
        SessionEventKind::UserRemoved(UserId::from("alice"))
    );

    // The second channel saw the same stream
    assert_eq!(
        next_kind(&mut bob_view).await,
        SessionEventKind::UserAdded(UserId::from("alice"))
    );

    let state = node.router().get_state(&session).await.unwrap();
    assert!(state.strokes.is_empty());
    assert!(state.connected_users.is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let node = start_node().await;
    let first = SessionId::from("board-1");
    let second = SessionId::from("board-2");
    let mut first_view = subscribed_channel(&node, &first).await;
    let mut second_view = subscribed_channel(&node, &second).await;

    node.append(&first, PaintMessage::Join(UserId::from("u1"))).await.unwrap();
    node.append(&second, PaintMessage::Join(UserId::from("u2"))).await.unwrap();

    assert_eq!(
        next_kind(&mut first_view).await,
        SessionEventKind::UserAdded(UserId::from("u1"))
    );
    assert_eq!(
        next_kind(&mut second_view).await,
        SessionEventKind::UserAdded(UserId::from("u2"))
    );
    assert!(first_view.try_recv().is_none());

    node.shutdown().await;
}

// ─── Activity index ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_index_tracks_join_and_passivation() {
    let node = start_node().await;
    let mut watch = node.watch_sessions();
    let session = SessionId::from("board-1");
    let _view = subscribed_channel(&node, &session).await;

    node.append(&session, PaintMessage::Join(UserId::from("u1"))).await.unwrap();
    node.append(&session, PaintMessage::Join(UserId::from("u2"))).await.unwrap();

    // Wait for a pushed list containing the live session
    let live = timeout(Duration::from_secs(5), async {
        loop {
            let list = watch.recv().await.unwrap();
            if let Some(entry) = list.into_iter().find(|s| s.session_id == session && !s.removed) {
                return entry;
            }
        }
    })
    .await
    .unwrap();
    assert!(live.active_users >= 1);

    // Idle timeout for tests is 500ms; passivation publishes a tombstone
    let tombstone = timeout(Duration::from_secs(5), async {
        loop {
            let all = node.all_sessions().await;
            if let Some(entry) = all.into_iter().find(|s| s.session_id == session && s.removed) {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(tombstone.active_users, 0);
    assert!(node.active_sessions().await.is_empty());

    node.shutdown().await;
}
