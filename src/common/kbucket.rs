//! Kbuckets
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    slice::Iter,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::common::{Id, Node, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 8;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Bucket is full")]
/// The bucket has no room left for a new node.
pub struct BucketFull;

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
///
/// A bucket covers the identifiers from its lower bound `first` up to (excluding)
/// the lower bound of the next bucket in the routing table.
pub struct KBucket {
    /// Lower bound of the covered range.
    first: Id,
    /// K (as in k-bucket) is the maximum number of nodes in a k-bucket.
    k: usize,
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    /// Keep track of the last time this bucket or any of its nodes were updated.
    last_updated: Instant,
}

impl KBucket {
    pub fn new(first: Id, k: usize) -> Self {
        KBucket {
            first,
            k,
            nodes: Vec::with_capacity(k),
            last_updated: Instant::now(),
        }
    }

    // === Getters ===

    /// Lower bound of the identifiers covered by this bucket.
    pub fn first(&self) -> &Id {
        &self.first
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    pub fn get_mut(&mut self, id: &Id) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| &node.id == id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    // === Public Methods ===

    /// Move an existing node to the back (most recently seen) and refresh it,
    /// or append a new one if there is room.
    pub fn insert_or_touch(
        &mut self,
        id: Id,
        address: SocketAddrV4,
    ) -> Result<&mut Node, BucketFull> {
        if let Some(index) = self.nodes.iter().position(|node| node.id == id) {
            let mut node = self.nodes.remove(index);
            node.update(address);
            self.nodes.push(node);
        } else if self.nodes.len() < self.k {
            self.nodes.push(Node::new(id, address));
        } else {
            return Err(BucketFull);
        }

        self.touch();

        self.nodes.last_mut().ok_or(BucketFull)
    }

    /// Remove a node, returns `true` if it existed.
    pub fn remove(&mut self, id: &Id) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| &node.id != id);

        before != self.nodes.len()
    }

    /// Uniformly pick a node, used to probe an otherwise idle bucket.
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Node> {
        if self.nodes.is_empty() {
            return None;
        }

        self.nodes.get(rng.gen_range(0..self.nodes.len()))
    }

    /// Remove every node for which `predicate` returns `true`, returns how many were removed.
    ///
    /// The predicate may mutate the nodes it keeps.
    pub fn sweep<F: FnMut(&mut Node) -> bool>(&mut self, mut predicate: F) -> usize {
        let before = self.nodes.len();
        self.nodes.retain_mut(|node| !predicate(node));

        before - self.nodes.len()
    }

    /// Returns `true` if this bucket was touched within `window` before `now`.
    pub fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_updated) <= window
    }

    /// Mark this bucket as recently active.
    pub fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    /// A random Id inside this bucket's range, given the number of bits fixed by its prefix.
    pub fn random_id<R: Rng + ?Sized>(&self, depth: usize, rng: &mut R) -> Id {
        let mut id = Id::random_from(rng);

        for i in 0..depth.min(ID_BITS) {
            id = id.set_bit(i, self.first.get_bit(i));
        }

        id
    }

    /// Move every node at or above `middle` into a new bucket starting at `middle`.
    pub(crate) fn split_off(&mut self, middle: Id) -> KBucket {
        let mut upper = KBucket::new(middle, self.k);
        upper.last_updated = self.last_updated;

        let (moved, kept): (Vec<Node>, Vec<Node>) =
            self.nodes.drain(..).partition(|node| node.id >= middle);
        self.nodes = kept;
        upper.nodes = moved;

        upper
    }
}

impl Debug for KBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "KBucket{{ first: {}, nodes: {} }}", self.first, self.nodes.len())
    }
}
