//! Hooks to observe the traffic handled by an [super::Rpc].
//!
//! Every method has a no-op default, implement only what you need.

use std::fmt::Debug;
use std::net::SocketAddrV4;

use crate::common::{ErrorSpecific, Id, Node};

/// Called for every incoming query, after it was answered.
pub trait QueryObserver {
    fn query_ping(&mut self, _from: &Id) {}

    fn query_find_node(&mut self, _from: &Id, _target: &Id) {}

    fn query_get_peers(&mut self, _from: &Id, _info_hash: &Id) {}

    /// `peer` is the address the requester asked to store, whether or not its token was valid.
    fn query_announce_peer(&mut self, _from: &Id, _info_hash: &Id, _peer: SocketAddrV4) {}
}

/// Called for every incoming reply, correlated to a search or not.
pub trait ReplyObserver {
    fn reply_ping(&mut self, _from: &Id) {}

    fn reply_find_node(&mut self, _from: &Id, _nodes: &[Node]) {}

    fn reply_get_peers(&mut self, _from: &Id, _values: &[SocketAddrV4], _nodes: &[Node]) {}

    fn reply_announce_peer(&mut self, _from: &Id) {}
}

/// Called for every incoming error message.
pub trait ErrorObserver {
    fn error(&mut self, _from: SocketAddrV4, _error: &ErrorSpecific) {}
}

/// All three capabilities, as stored by the [super::Rpc].
pub trait Observer: QueryObserver + ReplyObserver + ErrorObserver + Debug + Send {}

impl<T: QueryObserver + ReplyObserver + ErrorObserver + Debug + Send> Observer for T {}

#[derive(Debug, Default, Clone, Copy)]
/// Observer that ignores everything.
pub struct NoopObserver;

impl QueryObserver for NoopObserver {}
impl ReplyObserver for NoopObserver {}
impl ErrorObserver for NoopObserver {}
