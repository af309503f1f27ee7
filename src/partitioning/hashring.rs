//! Consistent hashing implementation with virtual nodes.
//!
//! Each physical node is represented by `weight × vnodes_per_weight` virtual
//! nodes placed on a 32-bit ring. A key belongs to the first virtual node at or
//! after its own position. The span between a virtual node and its predecessor
//! is a shard; migrating a shard reassigns the virtual node to another owner
//! without moving its position, so only that span changes hands.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use twox_hash::XxHash3_128;

/// Number of virtual nodes generated per unit of node weight.
pub const DEFAULT_VNODES_PER_WEIGHT: u32 = 150;

/// Map arbitrary bytes to a ring coordinate: XXH3-128 truncated to 32 bits.
pub fn hash_position(data: &[u8]) -> u32 {
    XxHash3_128::oneshot(data) as u32
}

/// A virtual node on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNode {
    /// Full 128-bit hash the position was derived from.
    pub hash: u128,

    /// Current owner of the segment ending at this position.
    pub node_id: NodeId,

    /// Position on the 32-bit ring.
    pub position: u32,
}

/// A half-open arc `(start, end]` of the ring. `start == end` covers the whole ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

impl HashRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The whole ring.
    pub fn full() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Whether `position` falls in this arc, handling wrap-around.
    pub fn contains(&self, position: u32) -> bool {
        if self.start < self.end {
            position > self.start && position <= self.end
        } else if self.start > self.end {
            position > self.start || position <= self.end
        } else {
            true
        }
    }

    /// Whether `key` hashes into this arc.
    pub fn contains_key(&self, key: &str) -> bool {
        self.contains(hash_position(key.as_bytes()))
    }

    /// Number of ring positions covered.
    pub fn width(&self) -> u64 {
        if self.start == self.end {
            1u64 << 32
        } else {
            u64::from(self.end.wrapping_sub(self.start))
        }
    }

    /// The position halfway through the arc, if the arc is wide enough to split.
    pub fn midpoint(&self) -> Option<u32> {
        let width = self.width();
        if width < 2 {
            return None;
        }
        Some(self.start.wrapping_add((width / 2) as u32))
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#010x}, {:#010x}]", self.start, self.end)
    }
}

/// One shard: the segment ending at a virtual node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    /// `s{n}` in ring order.
    pub id: String,
    pub range: HashRange,
    pub node_id: NodeId,
}

impl ShardRange {
    /// Position of the virtual node that closes this shard.
    pub fn position(&self) -> u32 {
        self.range.end
    }
}

/// Replica sets of one segment before and after a ring change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaChange {
    pub range: HashRange,
    pub before: Vec<NodeId>,
    pub after: Vec<NodeId>,
}

impl ReplicaChange {
    /// Nodes that must receive the range.
    pub fn joining(&self) -> impl Iterator<Item = &NodeId> {
        self.after.iter().filter(|n| !self.before.contains(n))
    }

    /// Nodes that stop replicating the range.
    pub fn leaving(&self) -> impl Iterator<Item = &NodeId> {
        self.before.iter().filter(|n| !self.after.contains(n))
    }
}

/// Serializable ring state, carried in storage snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingLayout {
    pub nodes: Vec<(NodeId, u32)>,
    pub vnodes: Vec<VirtualNode>,
}

/// A consistent hash ring for distributing keys across nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual nodes keyed by ring position.
    vnodes: BTreeMap<u32, VirtualNode>,

    /// Registered physical nodes and their weights.
    nodes: BTreeMap<NodeId, u32>,

    /// Virtual nodes per unit of weight.
    vnodes_per_weight: u32,

    /// Number of replicas (distinct nodes storing each key).
    num_replicas: usize,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VNODES_PER_WEIGHT, 1)
    }
}

impl HashRing {
    /// Create a new empty hash ring.
    pub fn new(vnodes_per_weight: u32, num_replicas: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            nodes: BTreeMap::new(),
            vnodes_per_weight,
            num_replicas: num_replicas.max(1),
        }
    }

    /// Get the number of replicas.
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Get the number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of virtual nodes (and therefore shards).
    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    /// Registered node ids, sorted.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Check if a node is registered.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Virtual nodes in ring order.
    pub fn vnodes(&self) -> impl Iterator<Item = &VirtualNode> {
        self.vnodes.values()
    }

    /// Add a node with `weight × vnodes_per_weight` virtual nodes.
    ///
    /// A weight of zero registers the node without giving it any segments.
    /// Returns the number of virtual nodes placed; adding a known node is a no-op.
    pub fn add_node(&mut self, node_id: &str, weight: u32) -> usize {
        if self.nodes.contains_key(node_id) {
            return 0;
        }
        self.nodes.insert(node_id.to_string(), weight);

        let mut placed = 0;
        for i in 0..weight.saturating_mul(self.vnodes_per_weight) {
            let hash = XxHash3_128::oneshot(format!("{node_id}-{i}").as_bytes());
            let position = hash as u32;
            // First writer keeps a contested position.
            if self.vnodes.contains_key(&position) {
                continue;
            }
            self.vnodes.insert(
                position,
                VirtualNode {
                    hash,
                    node_id: node_id.to_string(),
                    position,
                },
            );
            placed += 1;
        }
        placed
    }

    /// Remove a node and every segment it currently owns.
    ///
    /// Returns the number of virtual nodes removed.
    pub fn remove_node(&mut self, node_id: &str) -> usize {
        if self.nodes.remove(node_id).is_none() {
            return 0;
        }
        let before = self.vnodes.len();
        self.vnodes.retain(|_, vnode| vnode.node_id != node_id);
        before - self.vnodes.len()
    }

    /// Ring position of a key.
    pub fn key_position(key: &str) -> u32 {
        hash_position(key.as_bytes())
    }

    /// The virtual node responsible for `position`: first at or after it, wrapping.
    fn successor(&self, position: u32) -> Option<&VirtualNode> {
        self.vnodes
            .range(position..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, vnode)| vnode)
    }

    /// Primary owner of a key.
    pub fn route(&self, key: &str) -> Option<NodeId> {
        self.route_position(Self::key_position(key))
    }

    /// Primary owner of a ring position.
    pub fn route_position(&self, position: u32) -> Option<NodeId> {
        self.successor(position).map(|vnode| vnode.node_id.clone())
    }

    /// Up to `count` distinct nodes for a key, primary first.
    pub fn replicas(&self, key: &str, count: usize) -> Vec<NodeId> {
        self.replicas_at(Self::key_position(key), count)
    }

    /// Up to `count` distinct nodes walking clockwise from `position`.
    pub fn replicas_at(&self, position: u32, count: usize) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = Vec::with_capacity(count.min(self.nodes.len()));
        if count == 0 {
            return owners;
        }
        let iter = self.vnodes.range(position..).chain(self.vnodes.range(..position));
        for (_, vnode) in iter {
            if !owners.contains(&vnode.node_id) {
                owners.push(vnode.node_id.clone());
                if owners.len() >= count {
                    break;
                }
            }
        }
        owners
    }

    /// Whether `node_id` is among the configured replicas of `key`.
    pub fn is_replica(&self, node_id: &str, key: &str) -> bool {
        self.is_replica_at(node_id, Self::key_position(key))
    }

    /// Whether `node_id` is among the configured replicas of `position`.
    pub fn is_replica_at(&self, node_id: &str, position: u32) -> bool {
        self.replicas_at(position, self.num_replicas)
            .iter()
            .any(|n| n == node_id)
    }

    /// All shards in ring order.
    pub fn shards(&self) -> Vec<ShardRange> {
        let last = match self.vnodes.keys().next_back() {
            Some(&p) => p,
            None => return Vec::new(),
        };
        let mut prev = last;
        self.vnodes
            .values()
            .enumerate()
            .map(|(i, vnode)| {
                let shard = ShardRange {
                    id: format!("s{i}"),
                    range: HashRange::new(prev, vnode.position),
                    node_id: vnode.node_id.clone(),
                };
                prev = vnode.position;
                shard
            })
            .collect()
    }

    /// Look up a shard by id.
    pub fn shard(&self, shard_id: &str) -> Option<ShardRange> {
        let index: usize = shard_id.strip_prefix('s')?.parse().ok()?;
        let position = *self.vnodes.keys().nth(index)?;
        self.shard_at(position)
    }

    /// The shard closed by the virtual node at `position`.
    pub fn shard_at(&self, position: u32) -> Option<ShardRange> {
        let index = self.vnodes.range(..position).count();
        let vnode = self.vnodes.get(&position)?;
        let prev = self
            .vnodes
            .range(..position)
            .next_back()
            .or_else(|| self.vnodes.iter().next_back())
            .map(|(&p, _)| p)
            .unwrap_or(position);
        Some(ShardRange {
            id: format!("s{index}"),
            range: HashRange::new(prev, position),
            node_id: vnode.node_id.clone(),
        })
    }

    /// The shard containing `key`.
    pub fn shard_for_key(&self, key: &str) -> Option<ShardRange> {
        let position = self.successor(Self::key_position(key))?.position;
        self.shard_at(position)
    }

    /// Shard count per registered node, including nodes owning nothing.
    pub fn shard_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> =
            self.nodes.keys().map(|n| (n.clone(), 0)).collect();
        for vnode in self.vnodes.values() {
            *counts.entry(vnode.node_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Hand the segment ending at `position` to `node_id`.
    ///
    /// Returns false if there is no virtual node at `position`.
    pub fn reassign(&mut self, position: u32, node_id: &str) -> bool {
        match self.vnodes.get_mut(&position) {
            Some(vnode) => {
                vnode.node_id = node_id.to_string();
                if !self.nodes.contains_key(node_id) {
                    self.nodes.insert(node_id.to_string(), 0);
                }
                true
            }
            None => false,
        }
    }

    /// Segments whose replica set would change if the segment ending at
    /// `position` were handed to `node_id`.
    ///
    /// With more than one replica a flip also shifts the replica sets of the
    /// segments walking into it, so the result can name several ranges.
    pub fn reassign_changes(&self, position: u32, node_id: &str) -> Vec<ReplicaChange> {
        let mut after = self.clone();
        if !after.reassign(position, node_id) {
            return Vec::new();
        }
        self.shards()
            .into_iter()
            .filter_map(|shard| {
                let old = self.replicas_at(shard.position(), self.num_replicas);
                let new = after.replicas_at(shard.position(), self.num_replicas);
                let same = old.len() == new.len() && old.iter().all(|n| new.contains(n));
                (!same).then_some(ReplicaChange {
                    range: shard.range,
                    before: old,
                    after: new,
                })
            })
            .collect()
    }

    /// Insert a boundary at `at` inside the segment ending at `position`.
    ///
    /// The new segment `(prev, at]` keeps the same owner. Returns false if the
    /// boundary already exists or `at` is outside the segment.
    pub fn split(&mut self, position: u32, at: u32) -> bool {
        let shard = match self.shard_at(position) {
            Some(shard) => shard,
            None => return false,
        };
        if at == position || !shard.range.contains(at) || self.vnodes.contains_key(&at) {
            return false;
        }
        self.vnodes.insert(
            at,
            VirtualNode {
                hash: u128::from(at),
                node_id: shard.node_id,
                position: at,
            },
        );
        true
    }

    /// Remove the boundary at `position`; its span joins the following segment.
    ///
    /// Returns false if there is no such boundary or it is the last one.
    pub fn merge(&mut self, position: u32) -> bool {
        if self.vnodes.len() < 2 {
            return false;
        }
        self.vnodes.remove(&position).is_some()
    }

    /// The shard immediately after the one ending at `position`.
    pub fn next_shard(&self, position: u32) -> Option<ShardRange> {
        let next = position
            .checked_add(1)
            .and_then(|from| self.vnodes.range(from..).next())
            .or_else(|| self.vnodes.iter().next())
            .map(|(&p, _)| p)?;
        if next == position {
            return None;
        }
        self.shard_at(next)
    }

    /// Export the ring for persistence.
    pub fn layout(&self) -> RingLayout {
        RingLayout {
            nodes: self.nodes.iter().map(|(n, w)| (n.clone(), *w)).collect(),
            vnodes: self.vnodes.values().cloned().collect(),
        }
    }

    /// Replace the ring contents with a persisted layout.
    pub fn restore(&mut self, layout: RingLayout) {
        self.nodes = layout.nodes.into_iter().collect();
        self.vnodes = layout
            .vnodes
            .into_iter()
            .map(|vnode| (vnode.position, vnode))
            .collect();
    }

    /// Primary-owner distribution over `sample_size` synthetic keys.
    pub fn distribution(&self, sample_size: usize) -> HashMap<NodeId, usize> {
        let mut distribution = HashMap::new();
        for i in 0..sample_size {
            if let Some(owner) = self.route(&format!("sample_key_{i}")) {
                *distribution.entry(owner).or_insert(0) += 1;
            }
        }
        distribution
    }
}
