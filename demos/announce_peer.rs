use std::{str::FromStr, thread, time::Duration, time::Instant};

use kadnode::{Dht, Id};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// info_hash to annouce a peer on
    infohash: String,
    /// Port to announce, the node's own UDP port if omitted
    #[arg(short, long)]
    port: Option<u16>,
    /// Look the info_hash up again after announcing
    #[arg(long)]
    verify: bool,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let info_hash = Id::from_str(cli.infohash.as_str()).expect("invalid infohash");

    let dht = Dht::builder().build().unwrap();

    thread::sleep(Duration::from_secs(5));
    dht.find_closest(*dht.info().unwrap().id()).unwrap();

    let info = dht.info().unwrap();
    println!(
        "\nAnnouncing {}:{} on {} with {} nodes in the routing table ...\n",
        info.local_addr().ip(),
        cli.port.unwrap_or(info.local_addr().port()),
        info_hash,
        info.nodes()
    );

    let start = Instant::now();

    dht.announce_peer(info_hash, cli.port)
        .expect("announce_peer failed");

    println!(
        "Announced peer in {:?} seconds",
        start.elapsed().as_secs_f32()
    );

    if cli.verify {
        // Give the remote nodes a moment to store our announce.
        thread::sleep(Duration::from_secs(1));

        let peers: Vec<_> = dht.get_peers(info_hash).unwrap().collect();
        println!("{} peers now known for {}:", peers.len(), info_hash);
        for peer in peers {
            println!("  {peer}");
        }
    }

    dht.shutdown();
}
