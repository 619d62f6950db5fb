//! Micro-benchmarks for RoutingTable operations: insert, lookup, and remove
//! at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use kadnode::{Id, RoutingTable};
use rand::{rngs::StdRng, SeedableRng};
use std::net::SocketAddrV4;
use std::str::FromStr;
use std::time::Instant;

fn main() {
    println!("routing_table\n");

    bench_insert();
    bench_lookup();
    bench_remove();
}

fn filled(rng: &mut StdRng, size: usize, addr: SocketAddrV4) -> RoutingTable {
    let mut table = RoutingTable::new(Id::random_from(rng));
    for _ in 0..size {
        let _ = table.insert(Id::random_from(rng), addr);
    }
    table
}

fn bench_insert() {
    println!("insert");

    let mut rng = StdRng::seed_from_u64(1);
    let addr = SocketAddrV4::from_str("127.0.0.1:6881").unwrap();

    let ids: Vec<_> = (0..10_000).map(|_| Id::random_from(&mut rng)).collect();

    for size in [0, 100, 1000] {
        let mut table = filled(&mut rng, size, addr);

        let start = Instant::now();
        for id in &ids {
            let _ = table.insert(*id, addr);
        }
        let per_op = start.elapsed().as_nanos() / ids.len() as u128;
        println!(
            "{size:>4} prefilled: {per_op}ns/op (final size: {}, buckets: {})",
            table.size(),
            table.buckets().len()
        );
    }

    println!();
}

fn bench_lookup() {
    println!("lookup");

    let mut rng = StdRng::seed_from_u64(2);
    let addr = SocketAddrV4::from_str("127.0.0.1:6881").unwrap();
    let targets: Vec<_> = (0..1000).map(|_| Id::random_from(&mut rng)).collect();

    for size in [50, 200, 1000, 10_000] {
        let table = filled(&mut rng, size, addr);

        let start = Instant::now();
        for target in &targets {
            let _ = table.lookup(target);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{:>5} nodes: {per_op}ns/op", table.size());
    }

    println!();
}

fn bench_remove() {
    println!("remove");

    let mut rng = StdRng::seed_from_u64(3);
    let addr = SocketAddrV4::from_str("127.0.0.1:6881").unwrap();
    let mut table = filled(&mut rng, 1000, addr);

    let ids: Vec<_> = table.nodes().map(|node| node.id).collect();

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.remove(id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} removals)");
    println!();
}
