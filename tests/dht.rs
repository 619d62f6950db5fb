use std::net::SocketAddrV4;
use std::thread;
use std::time::{Duration, Instant};

use kadnode::{Dht, Id};

fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(20));
    }
}

fn local_node(bootstrap: &[String]) -> Dht {
    Dht::builder()
        .bootstrap(bootstrap)
        .maintenance_interval(Duration::from_millis(100))
        .build()
        .unwrap()
}

#[test]
fn announce_and_get_peers_over_loopback() {
    let a = local_node(&[]);
    let a_port = a.info().unwrap().local_addr().port();

    let b = local_node(&[format!("127.0.0.1:{a_port}")]);

    wait_until(|| a.info().unwrap().nodes() == 1 && b.info().unwrap().nodes() == 1);

    let info_hash = Id::random();

    b.announce_peer(info_hash, Some(4000)).unwrap();

    wait_until(|| a.info().unwrap().info_hashes() == 1);

    let peers: Vec<SocketAddrV4> = a.get_peers(info_hash).unwrap().collect();

    assert_eq!(peers, vec![SocketAddrV4::new([127, 0, 0, 1].into(), 4000)]);

    a.shutdown();
    b.shutdown();

    assert!(a.info().is_err());
}

#[test]
fn find_closest_over_loopback() {
    let a = local_node(&[]);
    let a_port = a.info().unwrap().local_addr().port();

    let b = local_node(&[format!("127.0.0.1:{a_port}")]);
    let c = local_node(&[format!("127.0.0.1:{a_port}")]);

    wait_until(|| a.info().unwrap().nodes() == 2);

    c.find_closest(*b.info().unwrap().id()).unwrap();

    wait_until(|| c.info().unwrap().nodes() == 2);
}
