//! Local reader hub: the node-side view of the activity index.
//!
//! Mirrors the replicator's merged replica and pushes the full summary
//! list to registered subscribers every `publish_interval`, but only when
//! the replica changed since the previous push. Tombstones are part of the
//! list so consumers can drop sessions that went away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use scribble_core::{ActivityIndex, ActivitySummary};

use super::replicator::Replicator;

/// Receives the full summary list on every push.
pub struct IndexSubscription {
    pub id: Uuid,
    rx: mpsc::UnboundedReceiver<Vec<ActivitySummary>>,
}

impl IndexSubscription {
    pub async fn recv(&mut self) -> Option<Vec<ActivitySummary>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<ActivitySummary>> {
        self.rx.try_recv().ok()
    }
}

enum Mail {
    Subscribe {
        id: Uuid,
        tx: mpsc::UnboundedSender<Vec<ActivitySummary>>,
    },
    Unsubscribe(Uuid),
    Snapshot {
        reply: oneshot::Sender<Arc<ActivityIndex>>,
    },
}

#[derive(Clone)]
pub struct IndexReader {
    mailbox: mpsc::UnboundedSender<Mail>,
}

impl IndexReader {
    pub fn spawn(replicator: &Replicator, publish_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let changes = replicator.changes();
        let actor = ReaderActor {
            replica: changes.borrow().clone(),
            dirty: false,
            subscribers: HashMap::new(),
        };
        tokio::spawn(actor.run(rx, changes, publish_interval));
        Self { mailbox: tx }
    }

    /// Every entry, tombstones included.
    pub async fn all(&self) -> Vec<ActivitySummary> {
        self.snapshot().await.summaries()
    }

    /// Live sessions only.
    pub async fn active(&self) -> Vec<ActivitySummary> {
        self.snapshot().await.active()
    }

    async fn snapshot(&self) -> Arc<ActivityIndex> {
        let (reply, rx) = oneshot::channel();
        if self.mailbox.send(Mail::Snapshot { reply }).is_err() {
            return Arc::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Registers a subscriber. The current list is delivered right away,
    /// later lists only when something changed. Dropping the subscription
    /// deregisters it.
    pub fn subscribe(&self) -> IndexSubscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.mailbox.send(Mail::Subscribe { id, tx });
        IndexSubscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let _ = self.mailbox.send(Mail::Unsubscribe(id));
    }
}

struct ReaderActor {
    replica: Arc<ActivityIndex>,
    dirty: bool,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<Vec<ActivitySummary>>>,
}

impl ReaderActor {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<Mail>,
        mut changes: watch::Receiver<Arc<ActivityIndex>>,
        publish_interval: Duration,
    ) {
        let mut tick = interval_at(Instant::now() + publish_interval, publish_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut replicator_alive = true;

        loop {
            tokio::select! {
                mail = mailbox.recv() => match mail {
                    Some(mail) => self.handle(mail),
                    None => break,
                },
                changed = changes.changed(), if replicator_alive => match changed {
                    Ok(()) => {
                        self.replica = changes.borrow_and_update().clone();
                        self.dirty = true;
                    }
                    Err(_) => replicator_alive = false,
                },
                _ = tick.tick() => self.push(),
            }
        }
    }

    fn handle(&mut self, mail: Mail) {
        match mail {
            Mail::Subscribe { id, tx } => {
                if tx.send(self.replica.summaries()).is_ok() {
                    self.subscribers.insert(id, tx);
                    log::debug!("Index subscriber {id} registered ({} total)", self.subscribers.len());
                }
            }
            Mail::Unsubscribe(id) => {
                self.subscribers.remove(&id);
            }
            Mail::Snapshot { reply } => {
                let _ = reply.send(self.replica.clone());
            }
        }
    }

    fn push(&mut self) {
        self.subscribers.retain(|id, tx| {
            let open = !tx.is_closed();
            if !open {
                log::debug!("Index subscriber {id} gone");
            }
            open
        });
        if self.subscribers.is_empty() {
            // Later subscribers start from a fresh snapshot anyway
            self.dirty = false;
            return;
        }
        if !self.dirty {
            return;
        }
        let summaries = self.replica.summaries();
        self.subscribers
            .retain(|_, tx| tx.send(summaries.clone()).is_ok());
        self.dirty = false;
    }
}
