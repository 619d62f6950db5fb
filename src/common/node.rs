//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use crate::common::Id;

/// Number of unanswered pings after which a node gets evicted.
pub const MAX_FAILED_PINGS: u8 = 2;

#[derive(Clone)]
/// Node entry in Kademlia routing table
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
    /// Last time we heard from this node.
    pub last_seen: Instant,
    /// Consecutive pings sent to this node without an answer.
    pub pinged: u8,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            last_seen: Instant::now(),
            pinged: 0,
        }
    }

    /// Creates a random node, useful for testing.
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new(0.into(), 0))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    // === Public Methods ===

    /// Mark this node as just contacted.
    pub fn update(&mut self, address: SocketAddrV4) {
        self.address = address;
        self.last_seen = Instant::now();
        self.pinged = 0;
    }

    /// Record a liveness check that is yet to be answered.
    pub fn failed_ping(&mut self) {
        self.pinged = self.pinged.saturating_add(1);
    }

    /// Returns `true` if this node was contacted within `window` before `now`,
    /// questionable otherwise.
    pub fn is_good(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= window
    }

    /// Returns `true` if this node didn't answer [MAX_FAILED_PINGS] pings in a row.
    pub fn is_unresponsive(&self) -> bool {
        self.pinged >= MAX_FAILED_PINGS
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("pinged", &self.pinged)
            .finish()
    }
}
