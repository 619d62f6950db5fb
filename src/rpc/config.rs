use std::time::Duration;

use crate::common::DEFAULT_K;
use crate::server::{ServerSettings, MAX_INFO_HASHES, MAX_PEERS};

use super::observer::Observer;
use super::socket::DEFAULT_PACKET_SIZE;

pub const DEFAULT_BOOTSTRAP_NODES: [&str; 4] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
    "router.magnets.im:6881",
];

pub const DEFAULT_SECRET_ROTATION_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_PEER_EXPIRY: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(30);
/// Keep looking up our own Id until the routing table holds this many nodes.
pub const DEFAULT_MIN_NODES: usize = 1024;
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_NODES]
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, binding an ephemeral port.
    pub port: Option<u16>,
    /// Maximum number of nodes per bucket, and of nodes returned by lookups.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// How long a token secret is used before being rotated.
    ///
    /// Defaults to [DEFAULT_SECRET_ROTATION_INTERVAL]
    pub secret_rotation_interval: Duration,
    /// A bucket untouched for this long is refreshed with a `find_node`,
    /// and nodes not heard from for this long get pinged.
    ///
    /// Defaults to [DEFAULT_BUCKET_REFRESH_INTERVAL]
    pub bucket_refresh_interval: Duration,
    /// Announced peers are forgotten after this long.
    ///
    /// Defaults to [DEFAULT_PEER_EXPIRY]
    pub peer_expiry: Duration,
    /// A search is considered done once its unanswered candidates were queried this long ago.
    ///
    /// Defaults to [DEFAULT_SEARCH_TIMEOUT]
    pub search_timeout: Duration,
    /// How often the [crate::Dht] runs maintenance.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
    /// How often the [crate::Dht] looks up its own Id while the table is small.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_INTERVAL]
    pub bootstrap_interval: Duration,
    /// Defaults to [DEFAULT_MIN_NODES]
    pub min_nodes: usize,
    /// Defaults to [MAX_INFO_HASHES]
    pub max_info_hashes: usize,
    /// Defaults to [MAX_PEERS]
    pub max_peers_per_info_hash: usize,
    /// Maximum number of peers in a single `get_peers` reply.
    ///
    /// Defaults to [DEFAULT_K]
    pub max_values_per_reply: usize,
    /// Datagrams received while the event loop is busy are dropped beyond this capacity.
    ///
    /// Defaults to [DEFAULT_INBOUND_QUEUE_CAPACITY]
    pub inbound_queue_capacity: usize,
    /// Receive buffer size.
    ///
    /// Defaults to [DEFAULT_PACKET_SIZE]
    pub packet_size: usize,
    /// Seed for this node's random number generator, useful for reproducible simulations.
    ///
    /// Defaults to None, seeding from the OS.
    pub seed: Option<u64>,
    /// Observer of incoming traffic.
    ///
    /// Defaults to None, where [super::NoopObserver] will be used.
    pub observer: Option<Box<dyn Observer>>,
}

impl Config {
    pub(crate) fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            max_info_hashes: self.max_info_hashes,
            max_peers_per_info_hash: self.max_peers_per_info_hash,
            max_values_per_reply: self.max_values_per_reply,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            port: None,
            k: DEFAULT_K,
            secret_rotation_interval: DEFAULT_SECRET_ROTATION_INTERVAL,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            peer_expiry: DEFAULT_PEER_EXPIRY,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            bootstrap_interval: DEFAULT_BOOTSTRAP_INTERVAL,
            min_nodes: DEFAULT_MIN_NODES,
            max_info_hashes: MAX_INFO_HASHES,
            max_peers_per_info_hash: MAX_PEERS,
            max_values_per_reply: DEFAULT_K,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            packet_size: DEFAULT_PACKET_SIZE,
            seed: None,
            observer: None,
        }
    }
}
