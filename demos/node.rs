//! Run a Dht node, logging its routing table every few seconds until Ctrl+C.
//!
//! Run: `cargo run --example node -- --port 6881`

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;
use kadnode::{
    rpc::{ErrorObserver, QueryObserver, ReplyObserver},
    Dht, Id,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// UDP port to listen on, random if omitted
    #[arg(short, long)]
    port: Option<u16>,
    /// Bootstrapping nodes, `host:port`, defaults to the well known routers
    #[arg(short, long)]
    bootstrap: Vec<String>,
    /// Seconds between status lines
    #[arg(short, long, default_value_t = 10)]
    interval: u64,
    /// Log every message sent and received
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default, Clone)]
/// Counts incoming queries by method.
struct Counters {
    ping: Arc<AtomicU64>,
    find_node: Arc<AtomicU64>,
    get_peers: Arc<AtomicU64>,
    announce_peer: Arc<AtomicU64>,
}

impl QueryObserver for Counters {
    fn query_ping(&mut self, _from: &Id) {
        self.ping.fetch_add(1, Ordering::Relaxed);
    }

    fn query_find_node(&mut self, _from: &Id, _target: &Id) {
        self.find_node.fetch_add(1, Ordering::Relaxed);
    }

    fn query_get_peers(&mut self, _from: &Id, _info_hash: &Id) {
        self.get_peers.fetch_add(1, Ordering::Relaxed);
    }

    fn query_announce_peer(&mut self, _from: &Id, _info_hash: &Id, _peer: std::net::SocketAddrV4) {
        self.announce_peer.fetch_add(1, Ordering::Relaxed);
    }
}

impl ReplyObserver for Counters {}
impl ErrorObserver for Counters {}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::TRACE } else { Level::INFO })
        .with_thread_names(true)
        .init();

    let counters = Counters::default();

    let mut builder = Dht::builder().observer(Box::new(counters.clone()));
    if let Some(port) = cli.port {
        builder = builder.port(port);
    }
    if !cli.bootstrap.is_empty() {
        builder = builder.bootstrap(&cli.bootstrap);
    }

    let dht = builder.build().expect("Failed to create Dht node");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .expect("Error setting Ctrl-C handler");

    info!("Dht node is running! Press Ctrl+C to stop.");

    let mut elapsed = 0;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        elapsed += 1;

        if elapsed % cli.interval.max(1) != 0 {
            continue;
        }

        let Ok(info) = dht.info() else {
            break;
        };

        info!(
            id = %info.id(),
            local_addr = %info.local_addr(),
            nodes = info.nodes(),
            buckets = info.buckets(),
            info_hashes = info.info_hashes(),
            searches = info.searches(),
            pings = counters.ping.load(Ordering::Relaxed),
            find_nodes = counters.find_node.load(Ordering::Relaxed),
            get_peers = counters.get_peers.load(Ordering::Relaxed),
            announces = counters.announce_peer.load(Ordering::Relaxed),
            "Status"
        );
    }

    info!("Shutting down...");
    dht.shutdown();
}
