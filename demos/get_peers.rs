use std::{str::FromStr, thread, time::Duration, time::Instant};

use kadnode::{Dht, Id};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// info_hash to lookup peers for
    infohash: String,
    /// Seconds to let the routing table fill up before searching
    #[arg(short, long, default_value_t = 5)]
    warmup: u64,
}

fn main() {
    tracing_subscriber::fmt()
        // Switch to DEBUG to see searches completing and dropped announces
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    let info_hash = Id::from_str(cli.infohash.as_str()).expect("Expected info_hash");

    let dht = Dht::builder().build().unwrap();

    println!("Bootstrapping for {} seconds ...", cli.warmup);
    thread::sleep(Duration::from_secs(cli.warmup));
    dht.find_closest(*dht.info().unwrap().id()).unwrap();

    println!("Looking up peers for info_hash: {} ...", info_hash);
    println!("\n=== COLD QUERY ===");
    get_peers(&dht, &info_hash);

    println!("\n=== SUBSEQUENT QUERY ===");
    println!("Looking up peers for info_hash: {} ...", info_hash);
    get_peers(&dht, &info_hash);

    dht.shutdown();
}

fn get_peers(dht: &Dht, info_hash: &Id) {
    let start = Instant::now();
    let mut first = false;

    let mut count = 0;

    for peer in dht.get_peers(*info_hash).unwrap() {
        if !first {
            first = true;
            println!(
                "Got first result in {:?} milliseconds:",
                start.elapsed().as_millis()
            );

            println!("peer {:?}", peer,);
        }

        count += 1;
    }

    println!(
        "\nQuery exhausted in {:?} milliseconds, got {:?} peers.",
        start.elapsed().as_millis(),
        count
    );
}
