//! Pending states, ordered by an explicit traversal strategy.

use std::collections::{BTreeSet, HashMap};

use crate::types::ArgId;

/// Order in which waiting states are popped.
///
/// There is no default: every reached set is created with an explicit order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TraversalOrder {
    /// Stack order: most recently added first.
    Dfs,
    /// Queue order: least recently added first.
    Bfs,
    /// Smallest reverse-postorder rank of the CFA location first; ties in
    /// stack order.
    Topological,
}

/// The waitlist: a set of ARG states pending expansion.
///
/// Adding a state that is already waiting keeps its original position.
#[derive(Debug, Clone)]
pub struct Waitlist {
    order: TraversalOrder,
    queue: BTreeSet<(u64, u64, ArgId)>,
    keys: HashMap<ArgId, (u64, u64)>,
    counter: u64,
}

impl Waitlist {
    pub fn new(order: TraversalOrder) -> Self {
        Self {
            order,
            queue: BTreeSet::new(),
            keys: HashMap::new(),
            counter: 0,
        }
    }

    pub fn order(&self) -> TraversalOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: ArgId) -> bool {
        self.keys.contains_key(&id)
    }

    /// Adds `id`, located at a node with reverse-postorder `rank`.
    ///
    /// Returns `false` if `id` was already waiting.
    pub fn push(&mut self, id: ArgId, rank: u32) -> bool {
        if self.keys.contains_key(&id) {
            return false;
        }
        let seq = self.counter;
        self.counter += 1;
        let key = match self.order {
            TraversalOrder::Dfs => (0, u64::MAX - seq),
            TraversalOrder::Bfs => (0, seq),
            TraversalOrder::Topological => (rank as u64, u64::MAX - seq),
        };
        self.keys.insert(id, key);
        self.queue.insert((key.0, key.1, id));
        true
    }

    pub fn pop(&mut self) -> Option<ArgId> {
        let (_, _, id) = self.queue.pop_first()?;
        self.keys.remove(&id);
        Some(id)
    }

    pub fn remove(&mut self, id: ArgId) -> bool {
        match self.keys.remove(&id) {
            Some((a, b)) => self.queue.remove(&(a, b, id)),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    /// Waiting states in pop order.
    pub fn iter(&self) -> impl Iterator<Item = ArgId> + '_ {
        self.queue.iter().map(|&(_, _, id)| id)
    }
}
