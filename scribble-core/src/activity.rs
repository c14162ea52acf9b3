//! Activity summaries and the last-writer-wins map they replicate through.
//!
//! ```text
//!   node A replica          node B replica            merged
//!  ┌───────────────┐       ┌───────────────┐       ┌───────────────┐
//!  │ s1 → (t=10,2) │   ⊔   │ s1 → (t=12,0✝)│   =   │ s1 → (t=12,0✝)│
//!  │ s2 → (t=7,1)  │       │ s3 → (t=9,4)  │       │ s2 → (t=7,1)  │
//!  └───────────────┘       └───────────────┘       │ s3 → (t=9,4)  │
//!                                                  └───────────────┘
//! ```
//!
//! Merge is a union of keys; a shared key keeps the summary with the greater
//! `last_update`. Ties are broken by `(removed, active_users)` so that the
//! result never depends on merge order: merge is commutative, associative
//! and idempotent, and replicas converge whatever order deltas arrive in.
//!
//! Pruning tombstones leaves a watermark behind. An entry for an unknown
//! session that is no newer than the watermark is ignored, so a replica
//! that still holds the pre-tombstone entry cannot bring a pruned session
//! back.
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types" (LWW-Register)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{SessionId, Timestamp};

/// Discovery record for one session, gossiped cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub session_id: SessionId,
    pub active_users: u32,
    pub last_update: Timestamp,
    /// Tombstone flag: the session was passivated.
    pub removed: bool,
}

impl ActivitySummary {
    pub fn active(session_id: SessionId, active_users: u32, last_update: Timestamp) -> Self {
        Self {
            session_id,
            active_users,
            last_update,
            removed: false,
        }
    }

    pub fn removed(session_id: SessionId, last_update: Timestamp) -> Self {
        Self {
            session_id,
            active_users: 0,
            last_update,
            removed: true,
        }
    }

    fn rank(&self) -> (Timestamp, bool, u32) {
        (self.last_update, self.removed, self.active_users)
    }

    /// True if `self` wins a last-writer-wins comparison against `other`.
    pub fn supersedes(&self, other: &ActivitySummary) -> bool {
        self.rank() > other.rank()
    }
}

/// LWW map `SessionId → ActivitySummary`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityIndex {
    entries: BTreeMap<SessionId, ActivitySummary>,
    /// Newest prune cutoff applied to this replica.
    pruned_through: Timestamp,
}

impl ActivityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one summary in. Returns `true` if the map changed.
    pub fn upsert(&mut self, summary: ActivitySummary) -> bool {
        match self.entries.get(&summary.session_id) {
            Some(current) if !summary.supersedes(current) => false,
            None if summary.last_update <= self.pruned_through => false,
            _ => {
                self.entries.insert(summary.session_id.clone(), summary);
                true
            }
        }
    }

    /// Merges another replica into this one. Returns `true` if anything changed.
    pub fn merge(&mut self, other: &ActivityIndex) -> bool {
        self.merge_entries(other.entries.values().cloned())
    }

    pub fn merge_entries(&mut self, entries: impl IntoIterator<Item = ActivitySummary>) -> bool {
        let mut changed = false;
        for summary in entries {
            changed |= self.upsert(summary);
        }
        changed
    }

    /// Drops tombstones whose `last_update` is at or before `cutoff`.
    /// Returns the number of entries removed.
    pub fn prune_tombstones(&mut self, cutoff: Timestamp) -> usize {
        self.pruned_through = self.pruned_through.max(cutoff);
        let before = self.entries.len();
        self.entries
            .retain(|_, summary| !(summary.removed && summary.last_update <= cutoff));
        before - self.entries.len()
    }

    pub fn pruned_through(&self) -> Timestamp {
        self.pruned_through
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&ActivitySummary> {
        self.entries.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivitySummary> {
        self.entries.values()
    }

    /// Every entry, tombstones included, ordered by session id.
    pub fn summaries(&self) -> Vec<ActivitySummary> {
        self.entries.values().cloned().collect()
    }

    /// Live sessions only.
    pub fn active(&self) -> Vec<ActivitySummary> {
        self.entries
            .values()
            .filter(|summary| !summary.removed)
            .cloned()
            .collect()
    }
}

impl FromIterator<ActivitySummary> for ActivityIndex {
    fn from_iter<I: IntoIterator<Item = ActivitySummary>>(iter: I) -> Self {
        let mut index = ActivityIndex::new();
        index.merge_entries(iter);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, users: u32, t: u64) -> ActivitySummary {
        ActivitySummary::active(SessionId::from(id), users, Timestamp::from_millis(t))
    }

    fn merged(a: &ActivityIndex, b: &ActivityIndex) -> ActivityIndex {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    #[test]
    fn test_merge_disjoint_is_union() {
        let a: ActivityIndex = [summary("s1", 1, 10), summary("s2", 2, 20)].into_iter().collect();
        let b: ActivityIndex = [summary("s3", 3, 30)].into_iter().collect();

        let m = merged(&a, &b);
        assert_eq!(m.len(), 3);
        for id in ["s1", "s2", "s3"] {
            assert!(m.get(&SessionId::from(id)).is_some());
        }
    }

    #[test]
    fn test_merge_keeps_greater_last_update() {
        let a: ActivityIndex = [summary("s1", 1, 10)].into_iter().collect();
        let b: ActivityIndex = [summary("s1", 5, 25)].into_iter().collect();

        let m = merged(&a, &b);
        let entry = m.get(&SessionId::from("s1")).unwrap();
        assert_eq!(entry.active_users, 5);
        assert_eq!(entry.last_update, Timestamp::from_millis(25));

        // Older write loses regardless of order
        let m2 = merged(&b, &a);
        assert_eq!(m, m2);
    }

    #[test]
    fn test_merge_commutative_associative_idempotent() {
        let a: ActivityIndex = [summary("s1", 1, 10), summary("s2", 4, 40)].into_iter().collect();
        let b: ActivityIndex = [
            summary("s1", 2, 10),
            ActivitySummary::removed(SessionId::from("s2"), Timestamp::from_millis(40)),
        ]
        .into_iter()
        .collect();
        let c: ActivityIndex = [summary("s1", 3, 11), summary("s4", 1, 1)].into_iter().collect();

        assert_eq!(merged(&a, &b), merged(&b, &a));
        assert_eq!(merged(&merged(&a, &b), &c), merged(&a, &merged(&b, &c)));
        assert_eq!(merged(&a, &a), a);

        let mut twice = merged(&a, &b);
        assert!(!twice.merge(&b));
        assert_eq!(twice, merged(&a, &b));
    }

    #[test]
    fn test_tombstone_wins_timestamp_tie() {
        let live = summary("s1", 3, 50);
        let dead = ActivitySummary::removed(SessionId::from("s1"), Timestamp::from_millis(50));
        assert!(dead.supersedes(&live));
        assert!(!live.supersedes(&dead));

        let mut index = ActivityIndex::new();
        index.upsert(live);
        assert!(index.upsert(dead));
        assert!(index.active().is_empty());
        assert_eq!(index.summaries().len(), 1);
    }

    #[test]
    fn test_upsert_reports_change() {
        let mut index = ActivityIndex::new();
        assert!(index.upsert(summary("s1", 1, 10)));
        assert!(!index.upsert(summary("s1", 1, 10)));
        assert!(!index.upsert(summary("s1", 9, 5)));
        assert!(index.upsert(summary("s1", 2, 11)));
    }

    #[test]
    fn test_prune_tombstones() {
        let mut index: ActivityIndex = [
            summary("live", 1, 10),
            ActivitySummary::removed(SessionId::from("old"), Timestamp::from_millis(10)),
            ActivitySummary::removed(SessionId::from("fresh"), Timestamp::from_millis(100)),
        ]
        .into_iter()
        .collect();

        assert_eq!(index.prune_tombstones(Timestamp::from_millis(50)), 1);
        assert!(index.get(&SessionId::from("old")).is_none());
        assert!(index.get(&SessionId::from("fresh")).is_some());
        assert!(index.get(&SessionId::from("live")).is_some());
    }

    #[test]
    fn test_pruned_session_is_not_resurrected() {
        let mut ours: ActivityIndex = [ActivitySummary::removed(SessionId::from("s1"), Timestamp::from_millis(20))]
            .into_iter()
            .collect();
        ours.prune_tombstones(Timestamp::from_millis(50));
        assert!(ours.is_empty());

        // A lagging replica never saw the tombstone
        let lagging: ActivityIndex = [summary("s1", 3, 10), summary("s2", 1, 40), summary("s3", 1, 60)]
            .into_iter()
            .collect();
        assert!(ours.merge(&lagging));
        assert!(ours.get(&SessionId::from("s1")).is_none());
        assert!(ours.get(&SessionId::from("s2")).is_none());
        assert_eq!(ours.get(&SessionId::from("s3")).unwrap().active_users, 1);
        assert_eq!(ours.pruned_through(), Timestamp::from_millis(50));

        // Known sessions still take newer summaries whatever their age
        let mut known: ActivityIndex = [summary("s4", 1, 10)].into_iter().collect();
        known.prune_tombstones(Timestamp::from_millis(50));
        assert!(known.upsert(summary("s4", 2, 30)));
    }
}
