use std::net::SocketAddrV4;

use crate::Id;

use super::{Rpc, Transport};

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    nodes: usize,
    buckets: usize,
    info_hashes: usize,
    searches: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Number of nodes in the routing table.
    pub fn nodes(&self) -> usize {
        self.nodes
    }
    pub fn buckets(&self) -> usize {
        self.buckets
    }
    /// Number of info hashes this node stores announced peers for.
    pub fn info_hashes(&self) -> usize {
        self.info_hashes
    }
    /// Searches in progress.
    pub fn searches(&self) -> usize {
        self.searches
    }
}

impl<T: Transport> From<&Rpc<T>> for Info {
    fn from(rpc: &Rpc<T>) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            nodes: rpc.route().size(),
            buckets: rpc.route().buckets().len(),
            info_hashes: rpc.server().peers.len(),
            searches: rpc.searches_count(),
        }
    }
}
