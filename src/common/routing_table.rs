//! Kademlia routing table with dynamically split buckets.
//!
//! Buckets are kept in an ordered vector, and their ranges exactly partition the
//! identifier space. Only the bucket covering our own Id is ever split.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddrV4;

use crate::common::{Id, KBucket, Node, DEFAULT_K, ID_BITS};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons a node was not added to the routing table.
///
/// Both are expected in steady state, not failures.
pub enum InsertError {
    /// The node has our own Id.
    #[error("Refusing to insert our own Id")]
    SelfInsertion,
    /// The covering bucket is full and can't be split.
    #[error("Node dropped, bucket is full")]
    Dropped,
}

#[derive(Debug)]
/// Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and the default bucket size.
    pub fn new(id: Id) -> Self {
        Self::with_k(id, DEFAULT_K)
    }

    /// Create a new [RoutingTable] with a custom bucket size.
    pub fn with_k(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k: k.max(1),
            buckets: vec![KBucket::new(Id::zero(), k.max(1))],
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Maximum number of nodes per bucket.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Returns the ordered buckets of this table.
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Returns an iterator over the nodes in this routing table, in bucket order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Returns the node with this Id if it exists.
    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.find_bucket(id).get(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    // === Public Methods ===

    /// Insert a new node or refresh an existing one, splitting our own bucket as needed.
    pub fn insert(&mut self, id: Id, address: SocketAddrV4) -> Result<&mut Node, InsertError> {
        if id == self.id {
            return Err(InsertError::SelfInsertion);
        }

        let index = loop {
            let index = self.bucket_index(&id);
            let bucket = &self.buckets[index];

            if bucket.contains(&id) || !bucket.is_full() {
                break index;
            }

            if !self.covers(index, &self.id) || !self.split(index) {
                self.buckets[index].touch();
                return Err(InsertError::Dropped);
            }
        };

        self.buckets[index]
            .insert_or_touch(id, address)
            .map_err(|_| InsertError::Dropped)
    }

    /// Remove a node from this routing table, returns `true` if it existed.
    pub fn remove(&mut self, id: &Id) -> bool {
        let index = self.bucket_index(id);
        self.buckets[index].remove(id)
    }

    /// Returns the bucket whose range contains `id`.
    pub fn find_bucket(&self, id: &Id) -> &KBucket {
        &self.buckets[self.bucket_index(id)]
    }

    /// Mutable version of [Self::find_bucket].
    pub fn find_bucket_mut(&mut self, id: &Id) -> &mut KBucket {
        let index = self.bucket_index(id);
        &mut self.buckets[index]
    }

    /// Number of prefix bits fixed by the bucket at `index`.
    pub fn depth(&self, index: usize) -> usize {
        let first = self.buckets[index].first().low_bit();
        let next = self
            .buckets
            .get(index + 1)
            .and_then(|bucket| bucket.first().low_bit());

        match (first, next) {
            (None, None) => 0,
            (a, b) => a.max(b).map_or(0, |bit| bit + 1),
        }
    }

    /// Up to `k` nodes closest to `target`, sorted by XOR distance.
    ///
    /// Starts from the covering bucket and walks outward to adjacent buckets, one
    /// shared prefix length at a time, until at least `k` candidates are gathered.
    /// Every node sharing a longer prefix with `target` is closer than any node
    /// outside it, so the result is exact and only depends on the buckets' content.
    pub fn lookup(&self, target: &Id) -> Vec<Node> {
        let start = self.bucket_index(target);

        let mut candidates: Vec<&Node> = self.buckets[start].iter().collect();
        let (mut low, mut high) = (start, start);

        let mut prefix = self.depth(start);

        while candidates.len() < self.k && prefix > 0 {
            prefix -= 1;

            let (from, to) = self.prefix_range(target, prefix);

            while low > from || high < to {
                if low > from {
                    low -= 1;
                    candidates.extend(self.buckets[low].iter());
                }
                if high < to {
                    high += 1;
                    candidates.extend(self.buckets[high].iter());
                }
            }
        }

        candidates.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
        candidates.truncate(self.k);

        candidates.into_iter().cloned().collect()
    }

    /// Call `f` on every bucket along with its index and depth.
    pub fn for_each_bucket<F: FnMut(usize, usize, &KBucket)>(&self, mut f: F) {
        for (index, bucket) in self.buckets.iter().enumerate() {
            f(index, self.depth(index), bucket);
        }
    }

    /// Mutable version of [Self::for_each_bucket], used by maintenance sweeps.
    pub fn for_each_bucket_mut<F: FnMut(usize, &mut KBucket)>(&mut self, mut f: F) {
        let depths: Vec<usize> = (0..self.buckets.len()).map(|i| self.depth(i)).collect();

        for (bucket, depth) in self.buckets.iter_mut().zip(depths) {
            f(depth, bucket);
        }
    }

    // === Private Methods ===

    /// Linear scan relying on the partition: the covering bucket is the last one
    /// whose lower bound is not above `id`.
    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets
            .iter()
            .skip(1)
            .position(|bucket| bucket.first() > id)
            .unwrap_or(self.buckets.len() - 1)
    }

    fn covers(&self, index: usize, id: &Id) -> bool {
        self.bucket_index(id) == index
    }

    /// Split the bucket at `index` in half, returns `false` if it is already at full depth.
    fn split(&mut self, index: usize) -> bool {
        let bit = self.depth(index);

        if bit >= ID_BITS {
            return false;
        }

        let middle = self.buckets[index].first().set_bit(bit, true);
        let upper = self.buckets[index].split_off(middle);

        self.buckets.insert(index + 1, upper);

        true
    }

    /// Indices of the first and last buckets overlapping the Ids that share
    /// `prefix` leading bits with `target`.
    fn prefix_range(&self, target: &Id, prefix: usize) -> (usize, usize) {
        let mut min = *target;
        let mut max = *target;

        for bit in prefix..ID_BITS {
            min = min.set_bit(bit, false);
            max = max.set_bit(bit, true);
        }

        (self.bucket_index(&min), self.bucket_index(&max))
    }
}

impl Display for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for bucket in &self.buckets {
            writeln!(f, "{} {}", bucket.first(), bucket.len())?;

            for node in bucket.iter() {
                writeln!(f, "  {} {}", node.id, node.address)?;
            }
        }

        Ok(())
    }
}
