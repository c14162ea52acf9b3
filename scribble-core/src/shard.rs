//! Static shard table: `fnv1a(session_id) mod N → owning node`.
//!
//! ```text
//!   "room-42" ──fnv1a──► 0x9e3f…  mod 50 ──► shard 17 ──► node-b
//! ```
//!
//! Placement of a key on a shard never changes. Only shard ownership moves,
//! and only through [`ShardTable::rebalance`], which computes the smallest
//! set of moves that leaves every node within one shard of every other.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::ids::{fnv1a_64, NodeId, SessionId};

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Shard a session lives on. `shard_count` of zero is treated as one.
pub fn shard_for(session_id: &SessionId, shard_count: u32) -> ShardId {
    let count = u64::from(shard_count.max(1));
    ShardId((fnv1a_64(session_id.as_str().as_bytes()) % count) as u32)
}

/// One ownership change produced by a rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMove {
    pub shard: ShardId,
    /// `None` if the shard had no owner, or its owner left the cluster.
    pub from: Option<NodeId>,
    pub to: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    #[error("Shard count must be positive")]
    ZeroShards,

    #[error("Cannot place shards on an empty node set")]
    NoNodes,

    #[error("Shard {0} is out of range")]
    UnknownShard(u32),
}

/// Owner of every shard. A shard with no owner is served by whoever holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTable {
    owners: Vec<Option<NodeId>>,
}

impl ShardTable {
    /// All shards unassigned.
    pub fn new(shard_count: u32) -> Result<Self, ShardError> {
        if shard_count == 0 {
            return Err(ShardError::ZeroShards);
        }
        Ok(Self {
            owners: vec![None; shard_count as usize],
        })
    }

    /// Balanced placement over `nodes`, in contiguous shard ranges.
    pub fn uniform(shard_count: u32, nodes: &[NodeId]) -> Result<Self, ShardError> {
        let mut table = Self::new(shard_count)?;
        table.rebalance(nodes)?;
        Ok(table)
    }

    pub fn shard_count(&self) -> u32 {
        self.owners.len() as u32
    }

    pub fn shard_of(&self, session_id: &SessionId) -> ShardId {
        shard_for(session_id, self.shard_count())
    }

    pub fn owner(&self, shard: ShardId) -> Option<&NodeId> {
        self.owners.get(shard.0 as usize).and_then(Option::as_ref)
    }

    pub fn owner_of(&self, session_id: &SessionId) -> Option<&NodeId> {
        self.owner(self.shard_of(session_id))
    }

    pub fn assign(&mut self, shard: ShardId, node: NodeId) -> Result<(), ShardError> {
        let slot = self
            .owners
            .get_mut(shard.0 as usize)
            .ok_or(ShardError::UnknownShard(shard.0))?;
        *slot = Some(node);
        Ok(())
    }

    pub fn shards_owned_by(&self, node: &NodeId) -> Vec<ShardId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_ref() == Some(node))
            .map(|(i, _)| ShardId(i as u32))
            .collect()
    }

    /// Nodes that currently own at least one shard.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.owners.iter().flatten().cloned().collect()
    }

    /// Computes the minimal moves that balance the table over `nodes`.
    ///
    /// Shards owned by a node outside `nodes`, or by nobody, always move.
    /// Beyond that a shard moves only if its owner holds more than its
    /// target. Nodes that already hold the most shards get the `+1`
    /// targets when the count does not divide evenly.
    pub fn plan_rebalance(&self, nodes: &[NodeId]) -> Result<Vec<ShardMove>, ShardError> {
        let members: BTreeSet<&NodeId> = nodes.iter().collect();
        if members.is_empty() {
            return Err(ShardError::NoNodes);
        }

        let mut owned: BTreeMap<&NodeId, Vec<u32>> =
            members.iter().map(|node| (*node, Vec::new())).collect();
        let mut pool: Vec<u32> = Vec::new();
        for (i, owner) in self.owners.iter().enumerate() {
            match owner.as_ref().and_then(|node| owned.get_mut(node)) {
                Some(shards) => shards.push(i as u32),
                None => pool.push(i as u32),
            }
        }

        let base = self.owners.len() / members.len();
        let extra = self.owners.len() % members.len();

        // Heaviest first, ties by node id, so the +1 targets cause no moves.
        let mut order: Vec<&NodeId> = members.iter().copied().collect();
        order.sort_by(|a, b| owned[b].len().cmp(&owned[a].len()).then(a.cmp(b)));
        let targets: BTreeMap<&NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(rank, node)| (*node, base + usize::from(rank < extra)))
            .collect();

        for (node, shards) in owned.iter_mut() {
            let target = targets[node];
            if shards.len() > target {
                pool.extend(shards.drain(target..));
            }
        }
        pool.sort_unstable();

        let mut moves = Vec::with_capacity(pool.len());
        let mut pool = pool.into_iter();
        for node in &order {
            let missing = targets[node].saturating_sub(owned[node].len());
            for shard in pool.by_ref().take(missing) {
                moves.push(ShardMove {
                    shard: ShardId(shard),
                    from: self.owners[shard as usize].clone(),
                    to: (*node).clone(),
                });
            }
        }
        moves.sort_by_key(|m| m.shard);
        Ok(moves)
    }

    pub fn apply(&mut self, moves: &[ShardMove]) -> Result<(), ShardError> {
        for m in moves {
            self.assign(m.shard, m.to.clone())?;
        }
        Ok(())
    }

    /// Plans and applies a rebalance. Returns the moves made.
    pub fn rebalance(&mut self, nodes: &[NodeId]) -> Result<Vec<ShardMove>, ShardError> {
        let moves = self.plan_rebalance(nodes)?;
        self.apply(&moves)?;
        Ok(moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn counts(table: &ShardTable, members: &[NodeId]) -> Vec<usize> {
        members.iter().map(|n| table.shards_owned_by(n).len()).collect()
    }

    fn assert_balanced(table: &ShardTable, members: &[NodeId]) {
        let c = counts(table, members);
        let max = c.iter().max().copied().unwrap_or(0);
        let min = c.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "unbalanced: {c:?}");
        assert_eq!(c.iter().sum::<usize>(), table.shard_count() as usize);
    }

    #[test]
    fn test_shard_for_is_stable_and_in_range() {
        let id = SessionId::from("room-42");
        let a = shard_for(&id, DEFAULT_SHARD_COUNT);
        let b = shard_for(&id, DEFAULT_SHARD_COUNT);
        assert_eq!(a, b);
        for i in 0..500 {
            let shard = shard_for(&SessionId::new(format!("s{i}")), DEFAULT_SHARD_COUNT);
            assert!(shard.0 < DEFAULT_SHARD_COUNT);
        }
        assert_eq!(shard_for(&id, 0), ShardId(0));
    }

    #[test]
    fn test_uniform_table_is_balanced() {
        let members = nodes(&["a", "b", "c"]);
        let table = ShardTable::uniform(DEFAULT_SHARD_COUNT, &members).unwrap();
        assert_balanced(&table, &members);
        assert_eq!(table.nodes().len(), 3);
    }

    #[test]
    fn test_adding_node_moves_only_what_it_needs() {
        let three = nodes(&["a", "b", "c"]);
        let mut table = ShardTable::uniform(DEFAULT_SHARD_COUNT, &three).unwrap();

        let four = nodes(&["a", "b", "c", "d"]);
        let moves = table.rebalance(&four).unwrap();
        assert_eq!(moves.len(), 12);
        assert!(moves.iter().all(|m| m.to == NodeId::from("d")));
        assert!(moves.iter().all(|m| m.from.is_some()));
        assert_balanced(&table, &four);
    }

    #[test]
    fn test_removing_node_moves_exactly_its_shards() {
        let three = nodes(&["a", "b", "c"]);
        let mut table = ShardTable::uniform(DEFAULT_SHARD_COUNT, &three).unwrap();
        let orphaned = table.shards_owned_by(&NodeId::from("c"));

        let two = nodes(&["a", "b"]);
        let moves = table.rebalance(&two).unwrap();
        let moved: Vec<ShardId> = moves.iter().map(|m| m.shard).collect();
        assert_eq!(moved, orphaned);
        assert_balanced(&table, &two);
        assert!(table.shards_owned_by(&NodeId::from("c")).is_empty());
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let members = nodes(&["a", "b", "c"]);
        let mut table = ShardTable::uniform(7, &members).unwrap();
        assert!(table.rebalance(&members).unwrap().is_empty());
    }

    #[test]
    fn test_errors() {
        assert_eq!(ShardTable::new(0), Err(ShardError::ZeroShards));
        let mut table = ShardTable::new(4).unwrap();
        assert_eq!(table.rebalance(&[]), Err(ShardError::NoNodes));
        assert_eq!(
            table.assign(ShardId(9), NodeId::from("a")),
            Err(ShardError::UnknownShard(9))
        );
        assert!(table.owner_of(&SessionId::from("s")).is_none());
    }
}
