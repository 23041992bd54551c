//! Storage identity resolution.
//!
//! Groups tensor inputs and allocator events that refer to the same memory
//! block. Addresses are recycled by the allocator, so an address alone is not
//! an identity: ids are assigned greedily while replaying allocations, frees
//! and op inputs in time order, then merged for tensors whose storage was
//! swapped during the session.

use crate::collection::encoder::TensorId;
use crate::collection::events::{EventKind, NodeId};
use crate::collection::tree::EventForest;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

type StorageId = usize;

#[derive(Debug, Clone, Copy)]
enum IdSlot {
    Input { node: NodeId, arg: usize },
    Allocation(NodeId),
}

#[derive(Debug, Clone, Copy)]
struct TensorStoragePair {
    /// `None` for allocator events, which have no owning tensor.
    impl_addr: Option<u64>,
    storage_id: StorageId,
    slot: IdSlot,
}

/// Provisional ids of the addresses currently live.
#[derive(Default)]
struct LiveStorage {
    next_id: StorageId,
    live: HashMap<u64, StorageId>,
}

impl LiveStorage {
    fn lookup(&mut self, data: u64) -> StorageId {
        let next_id = &mut self.next_id;
        *self.live.entry(data).or_insert_with(|| {
            *next_id += 1;
            *next_id - 1
        })
    }

    fn free(&mut self, data: u64) {
        self.live.remove(&data);
    }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Assign [`TensorId`]s to op inputs and allocations of a start-sorted forest.
///
/// Allocations whose address was never seen in a tensor input while live are
/// left without an id.
pub fn calculate_unique_tensor_ids(forest: &mut EventForest) {
    // Flatten and convert data pointers, handling address reuse.
    let mut live = LiveStorage::default();
    let mut tensors: Vec<TensorStoragePair> = Vec::new();
    let mut tensor_set: HashSet<StorageId> = HashSet::new();
    for (node, event) in forest.iter() {
        match &event.kind {
            EventKind::Op(op) => {
                for (arg, md) in op.inputs.tensor_metadata.iter().enumerate() {
                    if let Some(md) = md
                        && md.impl_addr != 0
                        && let Some(data) = md.data
                    {
                        let storage_id = live.lookup(data);
                        tensor_set.insert(storage_id);
                        tensors.push(TensorStoragePair {
                            impl_addr: Some(md.impl_addr),
                            storage_id,
                            slot: IdSlot::Input { node, arg },
                        });
                    }
                }
            }
            EventKind::Allocation(alloc) => {
                tensors.push(TensorStoragePair {
                    impl_addr: None,
                    storage_id: live.lookup(alloc.ptr),
                    slot: IdSlot::Allocation(node),
                });
                if alloc.alloc_size < 0 {
                    live.free(alloc.ptr);
                }
            }
            _ => {}
        }
    }
    let provisional = live.next_id;

    // Allocations never touched by a tensor cannot be proven to back one.
    let before = tensors.len();
    tensors.retain(|t| tensor_set.contains(&t.storage_id));
    debug!(
        dropped = before - tensors.len(),
        kept = tensors.len(),
        "resolving storage ids"
    );

    // A tensor seen with two different storages merges them.
    let mut same_group: BTreeSet<(StorageId, StorageId)> = BTreeSet::new();
    let mut impl_map: HashMap<u64, StorageId> = HashMap::new();
    for t in &tensors {
        let Some(impl_addr) = t.impl_addr else {
            continue;
        };
        let previous = impl_map.insert(impl_addr, t.storage_id).unwrap_or(t.storage_id);
        same_group.insert((previous.min(t.storage_id), previous.max(t.storage_id)));
    }

    let mut groups = UnionFind::new(provisional);
    for &(low, high) in &same_group {
        groups.union(low, high);
    }

    // Final ids follow each group's smallest provisional id.
    let mut final_ids: HashMap<usize, usize> = HashMap::new();
    let mut ordered: Vec<StorageId> = tensor_set.into_iter().collect();
    ordered.sort_unstable();
    for storage_id in ordered {
        let root = groups.find(storage_id);
        let next = final_ids.len();
        final_ids.entry(root).or_insert(next);
    }

    for t in &tensors {
        let root = groups.find(t.storage_id);
        let id = final_ids.get(&root).copied().map(TensorId);
        match t.slot {
            IdSlot::Input { node, arg } => {
                if let EventKind::Op(op) = &mut forest[node].kind
                    && let Some(Some(md)) = op.inputs.tensor_metadata.get_mut(arg)
                {
                    md.id = id;
                }
            }
            IdSlot::Allocation(node) => {
                if let EventKind::Allocation(alloc) = &mut forest[node].kind {
                    alloc.id = id;
                }
            }
        }
    }
}
