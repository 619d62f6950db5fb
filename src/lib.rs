//! Kademlia routing and lookup core for [BitTorrent's Mainline DHT](https://www.bittorrent.org/beps/bep_0005.html).
//!
//! - [RoutingTable]: buckets splitting along the node's own Id, and exact nearest-K lookups.
//! - [messages]: KRPC messages, transaction ids and compact node/peer encodings.
//! - [rpc::Rpc]: a single node's state machine, driven by a caller over any [rpc::Transport].
//! - [Dht]: a threaded node over UDP.

// Public modules
mod common;

mod dht;
mod error;
pub mod rpc;
pub mod server;

pub use crate::common::{
    messages, BucketFull, Id, InsertError, KBucket, Node, RoutingTable, DEFAULT_K, ID_SIZE,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, DhtSearchError, DhtWasShutdown, Response};
pub use error::Error;

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
