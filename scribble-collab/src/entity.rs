//! Session entity: the single-threaded owner of one session's state.
//!
//! Architecture:
//! ```text
//!   SessionRequest ──► mailbox ──┐
//!   tick (5s)     ───────────────┤      ┌──────────────────────────┐
//!   idle (2 min)  ───────────────┼────► │ SessionEntity            │
//!   self queue    ───────────────┘      │  SessionState (reducer)  │
//!                                       │  subscribers             │
//!                                       └───┬──────────┬───────────┘
//!                           append/snapshot │          │ ActivitySummary
//!                                           ▼          ▼
//!                                  dyn EventJournal   PublisherHandle
//! ```
//!
//! One message at a time, no locks. Timer fires and self-messages go
//! through the same loop as requests, so nothing ever touches the state
//! concurrently.
//!
//! Lifecycle: recover from the journal, serve, and after `idle_timeout`
//! without requests persist `SessionClosed`, publish a tombstone and ask
//! the hosting region to passivate. The region stops the entity; the next
//! request for the session starts a fresh one that replays the journal.
//! A fresh incarnation republishes its summary on its first tick, so the
//! index recovers from lost writes and hand-offs.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use uuid::Uuid;

use scribble_core::{
    CommandResult, SessionCommand, SessionEvent, SessionId, SessionState, Timestamp, UserId,
};

use crate::config::SessionConfig;
use crate::index::PublisherHandle;
use crate::storage::{recover, EventJournal, StoreError};

/// A local event consumer registered with a session.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: Uuid,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Watches an entity for termination.
///
/// Resolves once the entity task has ended, whether it stopped, was
/// passivated or panicked.
#[derive(Debug, Clone)]
pub struct Lifeline(watch::Receiver<()>);

impl Lifeline {
    /// Terminates when the paired sender is dropped.
    pub(crate) fn from_watch(rx: watch::Receiver<()>) -> Self {
        Self(rx)
    }

    pub async fn terminated(&mut self) {
        while self.0.changed().await.is_ok() {}
    }

    pub fn is_terminated(&self) -> bool {
        self.0.has_changed().is_err()
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeAck {
    pub session_id: SessionId,
    pub lifeline: Lifeline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeAck {
    pub session_id: SessionId,
}

/// Requests a session entity answers.
#[derive(Debug)]
pub enum SessionRequest {
    Command {
        command: SessionCommand,
        reply: oneshot::Sender<CommandResult>,
    },
    Subscribe {
        subscriber: Subscriber,
        reply: oneshot::Sender<SubscribeAck>,
    },
    Unsubscribe {
        subscriber_id: Uuid,
        reply: oneshot::Sender<UnsubscribeAck>,
    },
    GetState {
        reply: oneshot::Sender<SessionState>,
    },
    GetUsers {
        reply: oneshot::Sender<BTreeSet<UserId>>,
    },
}

/// Entity → host: "I am idle, stop me".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassivationRequest {
    pub session_id: SessionId,
    pub generation: u64,
}

#[derive(Debug)]
pub(crate) enum Mail {
    Request(SessionRequest),
    SubscriberGone(Uuid),
    /// Stop after the current message. Sent by the host.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelfMessage {
    PublishActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Everything an entity needs from its host.
#[derive(Clone)]
pub struct EntityContext {
    pub session_id: SessionId,
    /// Distinguishes incarnations of the same session in the host.
    pub generation: u64,
    pub journal: Arc<dyn EventJournal>,
    pub publisher: PublisherHandle,
    /// `None` → stop on idle without asking anyone.
    pub passivation: Option<mpsc::UnboundedSender<PassivationRequest>>,
    pub config: SessionConfig,
}

/// Host-side handle to a running entity.
#[derive(Clone)]
pub struct EntityHandle {
    pub(crate) mailbox: mpsc::UnboundedSender<Mail>,
    pub lifeline: Lifeline,
}

impl EntityHandle {
    /// Hands the request back if the entity is gone.
    pub fn send(&self, request: SessionRequest) -> Result<(), SessionRequest> {
        let Err(mpsc::error::SendError(mail)) = self.mailbox.send(Mail::Request(request)) else {
            return Ok(());
        };
        match mail {
            Mail::Request(request) => Err(request),
            Mail::SubscriberGone(_) | Mail::Stop => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub fn stop(&self) {
        let _ = self.mailbox.send(Mail::Stop);
    }
}

pub struct SessionEntity {
    ctx: EntityContext,
    state: SessionState,
    sequence: u64,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<SessionEvent>>,
    last_published: Timestamp,
    self_queue: VecDeque<SelfMessage>,
    closing: bool,
    failed_reply: Option<(oneshot::Sender<CommandResult>, CommandResult)>,
    lifeline: Lifeline,
    mailbox: mpsc::WeakUnboundedSender<Mail>,
    _alive: watch::Sender<()>,
}

impl SessionEntity {
    /// Spawns the entity task. Recovery runs inside the task; requests sent
    /// meanwhile wait in the mailbox.
    pub fn spawn(ctx: EntityContext) -> (EntityHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (alive, alive_rx) = watch::channel(());
        let lifeline = Lifeline(alive_rx);

        let entity = SessionEntity {
            state: SessionState::new(ctx.session_id.clone()),
            ctx,
            sequence: 0,
            subscribers: HashMap::new(),
            last_published: Timestamp::ZERO,
            self_queue: VecDeque::new(),
            closing: false,
            failed_reply: None,
            lifeline: lifeline.clone(),
            mailbox: tx.downgrade(),
            _alive: alive,
        };
        let join = tokio::spawn(entity.run(rx));

        let handle = EntityHandle {
            mailbox: tx,
            lifeline,
        };
        (handle, join)
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Mail>) {
        let session_id = self.ctx.session_id.clone();
        match recover(self.ctx.journal.as_ref(), &session_id) {
            Ok(recovered) => {
                log::info!(
                    "Session {session_id} recovered at seq {} (snapshot {}, {} replayed, {} skipped)",
                    recovered.sequence,
                    recovered.snapshot_sequence,
                    recovered.replayed,
                    recovered.skipped
                );
                self.state = recovered.state;
                self.sequence = recovered.sequence;
            }
            Err(e) => {
                log::error!("Session {session_id} failed to recover: {e}");
                return;
            }
        }

        let period = self.ctx.config.activity_interval;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_timeout = self.ctx.config.idle_timeout;
        let idle = sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            while let Some(msg) = self.self_queue.pop_front() {
                match msg {
                    SelfMessage::PublishActivity => self.publish_activity(),
                }
            }

            let flow = tokio::select! {
                mail = mailbox.recv() => match mail {
                    Some(Mail::Request(request)) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        self.handle_request(request)
                    }
                    Some(Mail::SubscriberGone(id)) => {
                        if self.subscribers.remove(&id).is_some() {
                            log::debug!("Session {session_id}: subscriber {id} terminated");
                        }
                        Flow::Continue
                    }
                    Some(Mail::Stop) | None => Flow::Stop,
                },
                _ = tick.tick() => {
                    self.publish_activity();
                    Flow::Continue
                }
                _ = &mut idle, if !self.closing => self.on_idle(),
            };

            if flow == Flow::Stop {
                break;
            }
        }

        // Refuse further mail before answering a failed command, so the
        // caller's next request goes to the host and starts a new entity.
        mailbox.close();
        if let Some((reply, result)) = self.failed_reply.take() {
            let _ = reply.send(result);
        }
        log::info!("Session {session_id} stopped at seq {}", self.sequence);
    }

    fn handle_request(&mut self, request: SessionRequest) -> Flow {
        match request {
            SessionRequest::Command { command, reply } => return self.handle_command(command, reply),
            SessionRequest::Subscribe { subscriber, reply } => {
                self.watch_subscriber(&subscriber);
                self.subscribers.insert(subscriber.id, subscriber.events);
                log::debug!(
                    "Session {}: subscriber {} registered ({} total)",
                    self.ctx.session_id,
                    subscriber.id,
                    self.subscribers.len()
                );
                let _ = reply.send(SubscribeAck {
                    session_id: self.ctx.session_id.clone(),
                    lifeline: self.lifeline.clone(),
                });
            }
            SessionRequest::Unsubscribe {
                subscriber_id,
                reply,
            } => {
                self.subscribers.remove(&subscriber_id);
                let _ = reply.send(UnsubscribeAck {
                    session_id: self.ctx.session_id.clone(),
                });
            }
            SessionRequest::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            SessionRequest::GetUsers { reply } => {
                let _ = reply.send(self.state.connected_users.clone());
            }
        }
        Flow::Continue
    }

    fn handle_command(
        &mut self,
        command: SessionCommand,
        reply: oneshot::Sender<CommandResult>,
    ) -> Flow {
        let now = Timestamp::now().max(self.state.last_update);
        let (result, events) = self.state.process_command(&command, now);
        if events.is_empty() {
            let _ = reply.send(result);
            return Flow::Continue;
        }

        let was_empty = self.state.is_empty();
        let mut reply = Some(reply);
        for event in events {
            if let Err(e) = self.persist(&event) {
                log::error!(
                    "Session {}: failed to persist {} from {}: {e}",
                    self.ctx.session_id,
                    event.name(),
                    command.name()
                );
                if let Some(reply) = reply.take() {
                    let result = CommandResult::timed_out(format!("persistence failed: {e}"));
                    self.failed_reply = Some((reply, result));
                }
                return Flow::Stop;
            }
            if let Some(reply) = reply.take() {
                let _ = reply.send(result.clone());
            }
            self.broadcast(&event);
        }

        if was_empty {
            self.self_queue.push_back(SelfMessage::PublishActivity);
        }
        Flow::Continue
    }

    /// Append, then apply, then maybe snapshot.
    fn persist(&mut self, event: &SessionEvent) -> Result<(), StoreError> {
        let session_id = &self.ctx.session_id;
        let sequence = self.ctx.journal.append(session_id, event)?;
        self.sequence = sequence;
        self.state.apply(event);

        let every = self.ctx.config.snapshot_every;
        if every > 0 && sequence % every == 0 {
            match self.ctx.journal.save_snapshot(session_id, sequence, &self.state) {
                Ok(()) => log::debug!("Session {session_id}: snapshot at seq {sequence}"),
                Err(e) => log::warn!("Session {session_id}: snapshot at seq {sequence} failed: {e}"),
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, event: &SessionEvent) {
        self.subscribers.retain(|id, events| {
            let delivered = events.send(event.clone()).is_ok();
            if !delivered {
                log::debug!("Subscriber {id} gone; dropping it");
            }
            delivered
        });
        log::trace!(
            "Session {}: {} fanned out to {} subscribers",
            self.ctx.session_id,
            event.name(),
            self.subscribers.len()
        );
    }

    /// Deregisters the subscriber once its receiving side is dropped.
    fn watch_subscriber(&self, subscriber: &Subscriber) {
        let events = subscriber.events.clone();
        let id = subscriber.id;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            events.closed().await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Mail::SubscriberGone(id));
            }
        });
    }

    fn publish_activity(&mut self) {
        let last_update = self.state.last_update;
        if self.closing || last_update.is_zero() || last_update == self.last_published {
            return;
        }
        self.ctx.publisher.publish(self.state.activity_summary());
        self.last_published = last_update;
    }

    fn on_idle(&mut self) -> Flow {
        let session_id = self.ctx.session_id.clone();
        log::info!(
            "Session {session_id} idle for {:?}; closing",
            self.ctx.config.idle_timeout
        );
        self.closing = true;

        let closed = SessionEvent::closed(session_id.clone(), Timestamp::now().max(self.state.last_update));
        if let Err(e) = self.persist(&closed) {
            log::error!("Session {session_id}: failed to persist SessionClosed: {e}");
            return Flow::Stop;
        }
        self.broadcast(&closed);

        self.ctx.publisher.publish(self.state.activity_summary());
        self.last_published = self.state.last_update;

        match &self.ctx.passivation {
            Some(host) => {
                let request = PassivationRequest {
                    session_id,
                    generation: self.ctx.generation,
                };
                if host.send(request).is_err() {
                    return Flow::Stop;
                }
                Flow::Continue
            }
            None => Flow::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryJournal;
    use scribble_core::{
        ActivitySummary, Color, ConnectedStroke, Point, ResultCode, SessionEventKind, StrokeId,
        StrokeWidth,
    };
    use std::time::Duration;

    struct Harness {
        handle: EntityHandle,
        join: JoinHandle<()>,
        journal: Arc<MemoryJournal>,
        activity: mpsc::UnboundedReceiver<ActivitySummary>,
        passivation: mpsc::UnboundedReceiver<PassivationRequest>,
    }

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    fn start_with(journal: Arc<MemoryJournal>, config: SessionConfig) -> Harness {
        let (publisher, activity) = PublisherHandle::channel();
        let (passivation_tx, passivation) = mpsc::unbounded_channel();
        let (handle, join) = SessionEntity::spawn(EntityContext {
            session_id: sid(),
            generation: 1,
            journal: journal.clone(),
            publisher,
            passivation: Some(passivation_tx),
            config,
        });
        Harness {
            handle,
            join,
            journal,
            activity,
            passivation,
        }
    }

    fn start() -> Harness {
        start_with(Arc::new(MemoryJournal::new()), SessionConfig::default())
    }

    async fn command(handle: &EntityHandle, command: SessionCommand) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        handle
            .send(SessionRequest::Command { command, reply })
            .unwrap();
        rx.await.unwrap()
    }

    async fn subscribe(handle: &EntityHandle) -> (mpsc::UnboundedReceiver<SessionEvent>, SubscribeAck) {
        let (events, rx) = mpsc::unbounded_channel();
        let (reply, ack) = oneshot::channel();
        handle
            .send(SessionRequest::Subscribe {
                subscriber: Subscriber {
                    id: Uuid::new_v4(),
                    events,
                },
                reply,
            })
            .unwrap();
        (rx, ack.await.unwrap())
    }

    async fn get_state(handle: &EntityHandle) -> SessionState {
        let (reply, rx) = oneshot::channel();
        handle.send(SessionRequest::GetState { reply }).unwrap();
        rx.await.unwrap()
    }

    fn add_user(user: &str) -> SessionCommand {
        SessionCommand::AddUser {
            session_id: sid(),
            user_id: UserId::from(user),
        }
    }

    fn add_stroke(id: u64) -> SessionCommand {
        SessionCommand::AddStroke {
            session_id: sid(),
            stroke: ConnectedStroke::new(
                StrokeId(id),
                vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
                StrokeWidth::default(),
                Color::default(),
            ),
        }
    }

    #[tokio::test]
    async fn test_command_persists_and_broadcasts() {
        let mut h = start();
        let (mut events, ack) = subscribe(&h.handle).await;
        assert_eq!(ack.session_id, sid());

        let result = command(&h.handle, add_user("u1")).await;
        assert_eq!(result.code, ResultCode::Ok);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::UserAdded(UserId::from("u1")));
        assert_eq!(h.journal.records(&sid()).len(), 1);

        // Cold start publishes right away instead of waiting for the tick
        let summary = h.activity.recv().await.unwrap();
        assert_eq!(summary.active_users, 1);
        assert!(!summary.removed);
    }

    #[tokio::test]
    async fn test_noop_and_bad_request_write_nothing() {
        let h = start();
        command(&h.handle, add_user("u1")).await;

        assert_eq!(command(&h.handle, add_user("u1")).await.code, ResultCode::NoOp);
        let bad = command(
            &h.handle,
            SessionCommand::RemoveUser {
                session_id: sid(),
                user_id: UserId::from("u2"),
            },
        )
        .await;
        assert_eq!(bad.code, ResultCode::BadRequest);
        assert_eq!(h.journal.records(&sid()).len(), 1);
    }

    #[tokio::test]
    async fn test_recovers_from_journal_and_snapshots() {
        let journal = Arc::new(MemoryJournal::new());
        let config = SessionConfig {
            snapshot_every: 3,
            ..SessionConfig::default()
        };

        let first = start_with(journal.clone(), config.clone());
        for id in 0..7 {
            command(&first.handle, add_stroke(id)).await;
        }
        let before = get_state(&first.handle).await;
        first.handle.stop();
        first.join.await.unwrap();

        assert_eq!(journal.load_snapshot(&sid()).unwrap().unwrap().sequence, 6);

        let second = start_with(journal, config);
        let after = get_state(&second.handle).await;
        assert_eq!(after, before);
        assert_eq!(after.strokes.len(), 7);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_deregistered() {
        let h = start();
        let (events, _ack) = subscribe(&h.handle).await;
        drop(events);

        // The next broadcast must not fail because of the dead subscriber
        assert_eq!(command(&h.handle, add_user("u1")).await.code, ResultCode::Ok);
        let (mut live, _ack) = subscribe(&h.handle).await;
        command(&h.handle, add_user("u2")).await;
        assert!(live.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_persistence_failure_times_out_and_stops() {
        let h = start();
        h.journal.set_fail_appends(true);

        let result = command(&h.handle, add_user("u1")).await;
        assert_eq!(result.code, ResultCode::TimeOut);
        assert!(result.message.unwrap_or_default().contains("persistence failed"));

        let mut lifeline = h.handle.lifeline.clone();
        tokio::time::timeout(Duration::from_secs(1), lifeline.terminated())
            .await
            .unwrap();
        assert!(lifeline.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick_publishes_only_on_change() {
        let mut h = start();
        command(&h.handle, add_user("u1")).await;
        // Cold-start publish
        assert_eq!(h.activity.recv().await.unwrap().active_users, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(h.activity.try_recv().is_err(), "nothing changed, nothing published");

        // Sessions that already had state do not cold-start publish.
        // Wall-clock millis must move for last_update to change.
        std::thread::sleep(Duration::from_millis(3));
        command(&h.handle, add_user("u2")).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.activity.try_recv().unwrap().active_users, 2);
        assert!(h.activity.try_recv().is_err());
    }

    fn prefill(journal: &MemoryJournal, events: &[(u64, SessionEventKind)]) {
        for (millis, kind) in events {
            let event = SessionEvent::new(sid(), Timestamp::from_millis(*millis), kind.clone());
            journal.append(&sid(), &event).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_session_republishes_on_first_tick() {
        let journal = Arc::new(MemoryJournal::new());
        prefill(&journal, &[(1_000, SessionEventKind::UserAdded(UserId::from("u1")))]);

        let mut h = start_with(journal, SessionConfig::default());
        tokio::time::sleep(Duration::from_secs(6)).await;
        let summary = h.activity.try_recv().unwrap();
        assert_eq!(summary.active_users, 1);
        assert!(!summary.removed);
        assert_eq!(summary.last_update, Timestamp::from_millis(1_000));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.activity.try_recv().is_err(), "published once per change");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_closed_session_republishes_tombstone() {
        let journal = Arc::new(MemoryJournal::new());
        prefill(
            &journal,
            &[
                (1_000, SessionEventKind::UserAdded(UserId::from("u1"))),
                (2_000, SessionEventKind::SessionClosed),
            ],
        );

        let mut h = start_with(journal.clone(), SessionConfig::default());
        tokio::time::sleep(Duration::from_secs(6)).await;
        let summary = h.activity.try_recv().unwrap();
        assert!(summary.removed);
        assert_eq!(summary.last_update, Timestamp::from_millis(2_000));

        // A command after the close reopens the session in the index
        h.handle.stop();
        h.join.await.unwrap();
        prefill(&journal, &[(3_000, SessionEventKind::UserAdded(UserId::from("u2")))]);
        let mut h = start_with(journal, SessionConfig::default());
        tokio::time::sleep(Duration::from_secs(6)).await;
        let summary = h.activity.try_recv().unwrap();
        assert!(!summary.removed);
        assert_eq!(summary.active_users, 1);
        assert_eq!(summary.last_update, Timestamp::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_closes_exactly_once() {
        let mut h = start();
        let (mut events, _ack) = subscribe(&h.handle).await;
        command(&h.handle, add_user("u1")).await;
        assert!(events.recv().await.is_some());

        tokio::time::sleep(Duration::from_secs(121)).await;
        let request = h.passivation.recv().await.unwrap();
        assert_eq!(request.session_id, sid());
        assert_eq!(request.generation, 1);

        // Long after: still exactly one of each
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.passivation.try_recv().is_err());

        let closed: Vec<_> = h
            .journal
            .records(&sid())
            .iter()
            .filter_map(|r| r.event().ok())
            .filter(SessionEvent::is_closed)
            .collect();
        assert_eq!(closed.len(), 1);

        let mut removed = 0;
        while let Ok(summary) = h.activity.try_recv() {
            if summary.removed {
                assert_eq!(summary.active_users, 0);
                removed += 1;
            }
        }
        assert_eq!(removed, 1);

        assert!(events.recv().await.is_some_and(|e| e.is_closed()));

        h.handle.stop();
        h.join.await.unwrap();
    }
}
