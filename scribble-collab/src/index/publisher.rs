//! Activity publisher: turns entity summaries into replicated index writes.
//!
//! Entities never wait on replication. They push summaries into an
//! unbounded channel and move on; the publisher issues one majority write
//! per summary and logs the outcome. A slow or partitioned cluster
//! therefore delays index convergence, never drawing.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use scribble_core::{ActivitySummary, Timestamp};

use super::replicator::{Replicator, UpdateOutcome, WriteConsistency};
use crate::config::IndexConfig;

/// Entity-side publishing handle.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<ActivitySummary>,
}

impl PublisherHandle {
    /// A handle whose summaries land in the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ActivitySummary>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire and forget. Summaries sent after the publisher stopped are dropped.
    pub fn publish(&self, summary: ActivitySummary) {
        if self.tx.send(summary).is_err() {
            log::debug!("Activity publisher stopped; summary dropped");
        }
    }
}

pub struct ActivityPublisher;

impl ActivityPublisher {
    /// Spawns the publisher loop. It also prunes tombstones older than
    /// `tombstone_ttl` every `prune_interval`.
    pub fn spawn(replicator: Replicator, config: &IndexConfig) -> (PublisherHandle, JoinHandle<()>) {
        let (handle, rx) = PublisherHandle::channel();
        let join = tokio::spawn(Self::run(
            rx,
            replicator,
            config.write_timeout,
            config.prune_interval,
            config.tombstone_ttl,
        ));
        (handle, join)
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<ActivitySummary>,
        replicator: Replicator,
        write_timeout: Duration,
        prune_interval: Duration,
        tombstone_ttl: Duration,
    ) {
        let mut prune = interval_at(Instant::now() + prune_interval, prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                summary = rx.recv() => {
                    let Some(summary) = summary else { break };
                    let replicator = replicator.clone();
                    tokio::spawn(async move {
                        let session_id = summary.session_id.clone();
                        let removed = summary.removed;
                        let outcome = replicator
                            .update(summary, WriteConsistency::Majority { timeout: write_timeout })
                            .await;
                        match outcome {
                            UpdateOutcome::Success => {
                                log::debug!("Activity for {session_id} replicated (removed: {removed})");
                            }
                            UpdateOutcome::Timeout { acks, required } => {
                                log::warn!(
                                    "Activity for {session_id} reached {acks}/{required} peers before timeout"
                                );
                            }
                            UpdateOutcome::Stopped => {
                                log::warn!("Activity for {session_id} dropped: replicator stopped");
                            }
                        }
                    });
                }
                _ = prune.tick() => {
                    let cutoff = Timestamp::now().saturating_sub(tombstone_ttl);
                    let pruned = replicator.prune(cutoff).await;
                    if pruned > 0 {
                        log::info!("Pruned {pruned} session tombstones");
                    }
                }
            }
        }
        log::debug!("Activity publisher stopped");
    }
}
