//! Dht node.

use std::{
    io,
    net::{SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError, WeakSender};
use tracing::{debug, error, info, trace};

use crate::{
    common::Id,
    rpc::{Config, Info, KrpcSocket, Observer, Rpc, SearchCallback, SearchError},
};

#[derive(Debug, Clone)]
/// Handle to a Dht node running on its own thread.
///
/// Cloning the handle is cheap, the node shuts down once every handle is dropped,
/// or [Dht::shutdown] is called.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default)]
/// Builder for a [Dht] node.
pub struct DhtBuilder {
    id: Option<Id>,
    config: Config,
}

impl DhtBuilder {
    /// Set this node's Id, defaults to a random one.
    pub fn id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    /// Set bootstrapping nodes, `host:port` strings.
    pub fn bootstrap(mut self, bootstrap: &[String]) -> Self {
        self.config.bootstrap = bootstrap.to_vec();
        self
    }

    /// Set an explicit port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Set the bucket size, and the number of nodes returned by lookups.
    pub fn k(mut self, k: usize) -> Self {
        self.config.k = k;
        self.config.max_values_per_reply = k;
        self
    }

    /// Seed this node's random number generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Observe incoming queries, replies and errors.
    pub fn observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Stop bootstrapping once the routing table holds this many nodes.
    pub fn min_nodes(mut self, min_nodes: usize) -> Self {
        self.config.min_nodes = min_nodes;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval = interval;
        self
    }

    pub fn search_timeout(mut self, timeout: Duration) -> Self {
        self.config.search_timeout = timeout;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Bind the socket and start the node's threads.
    pub fn build(self) -> io::Result<Dht> {
        Dht::new(self.id.unwrap_or_else(Id::random), self.config)
    }
}

impl Dht {
    /// Create a new Dht node with an explicit [Config].
    pub fn new(id: Id, config: Config) -> io::Result<Self> {
        let socket = KrpcSocket::bind(config.port)?;
        let reader = socket.reader()?;

        let (sender, receiver) = flume::bounded(config.inbound_queue_capacity);

        let settings = ActorSettings::from(&config);
        let packet_size = config.packet_size;

        let rpc = Rpc::new(id, socket, config);

        info!(?id, local_addr = ?rpc.local_addr(), "Dht listening");

        let weak = sender.downgrade();
        thread::Builder::new()
            .name("kadnode-reader".to_string())
            .spawn(move || read_loop(reader, weak, packet_size))?;

        thread::Builder::new()
            .name("kadnode-actor".to_string())
            .spawn(move || run(rpc, settings, receiver))?;

        Ok(Dht(sender))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop, and wait for it to stop.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Send a `find_node` query for `target` to the closest nodes we know, without
    /// waiting for replies.
    pub fn find_node(&self, target: Id) -> Result<(), DhtWasShutdown> {
        self.0
            .send(ActorMessage::FindNode(target))
            .map_err(|_| DhtWasShutdown)
    }

    pub fn ping(&self, address: SocketAddrV4) -> Result<(), DhtWasShutdown> {
        self.0
            .send(ActorMessage::Ping(address))
            .map_err(|_| DhtWasShutdown)
    }

    /// Look up the nodes closest to `target`, blocking until the lookup is done.
    pub fn find_closest(&self, target: Id) -> Result<(), DhtSearchError> {
        let (sender, receiver) = flume::bounded::<()>(1);

        self.start_search(SearchKind::Closest, target, done_callback(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)?;

        Ok(())
    }

    /// Get peers for a given info hash.
    ///
    /// Peers stored locally come first, then peers as they are found, the
    /// iterator ends once the search is done.
    pub fn get_peers(&self, info_hash: Id) -> Result<Response<SocketAddrV4>, DhtSearchError> {
        let (sender, receiver) = flume::unbounded::<SocketAddrV4>();

        let mut sender = Some(sender);
        let callback: SearchCallback = Box::new(move |peer| match peer {
            Some(peer) => {
                if let Some(sender) = &sender {
                    let _ = sender.send(peer);
                }
            }
            None => sender = None,
        });

        self.start_search(SearchKind::Peers, info_hash, callback)?;

        Ok(Response { receiver })
    }

    /// Announce this node as a peer for `info_hash`, blocking until the nodes
    /// closest to it were asked to store it.
    ///
    /// `port` of `None` asks them to use this node's UDP port.
    pub fn announce_peer(&self, info_hash: Id, port: Option<u16>) -> Result<(), DhtSearchError> {
        let (sender, receiver) = flume::bounded::<()>(1);

        self.start_search(SearchKind::Announce(port), info_hash, done_callback(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)?;

        Ok(())
    }

    // === Private Methods ===

    fn start_search(
        &self,
        kind: SearchKind,
        target: Id,
        callback: SearchCallback,
    ) -> Result<(), DhtSearchError> {
        let (sender, receiver) = flume::bounded::<Result<(), SearchError>>(1);

        self.0
            .send(ActorMessage::Search {
                kind,
                target,
                callback,
                result: sender,
            })
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)??;

        Ok(())
    }
}

/// Callback that signals `sender` once the search is done.
fn done_callback(sender: Sender<()>) -> SearchCallback {
    Box::new(move |peer| {
        if peer.is_none() {
            let _ = sender.try_send(());
        }
    })
}

/// Blocking iterator over the results of a search.
pub struct Response<T> {
    receiver: Receiver<T>,
}

impl<T> Iterator for Response<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

#[derive(Debug)]
struct ActorSettings {
    bootstrap: Vec<String>,
    secret_rotation_interval: Duration,
    bucket_refresh_interval: Duration,
    peer_expiry: Duration,
    maintenance_interval: Duration,
    bootstrap_interval: Duration,
    min_nodes: usize,
}

impl From<&Config> for ActorSettings {
    fn from(config: &Config) -> Self {
        Self {
            bootstrap: config.bootstrap.clone(),
            secret_rotation_interval: config.secret_rotation_interval,
            bucket_refresh_interval: config.bucket_refresh_interval,
            peer_expiry: config.peer_expiry,
            maintenance_interval: config.maintenance_interval,
            bootstrap_interval: config.bootstrap_interval,
            min_nodes: config.min_nodes,
        }
    }
}

fn run(mut rpc: Rpc<KrpcSocket>, settings: ActorSettings, receiver: Receiver<ActorMessage>) {
    let id = *rpc.id();

    for address in resolve(&settings.bootstrap) {
        rpc.find_node_from(id, address);
    }

    let mut last_maintenance = Instant::now();
    let mut last_bootstrap = Instant::now();

    loop {
        let timeout = settings
            .maintenance_interval
            .saturating_sub(last_maintenance.elapsed())
            .min(
                settings
                    .bootstrap_interval
                    .saturating_sub(last_bootstrap.elapsed()),
            );

        match receiver.recv_timeout(timeout) {
            Ok(ActorMessage::Shutdown(sender)) => {
                drop(receiver);
                let _ = sender.send(());
                break;
            }
            Ok(message) => handle_actor_message(&mut rpc, message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_maintenance.elapsed() >= settings.maintenance_interval {
            last_maintenance = Instant::now();

            rpc.do_maintenance(
                settings.secret_rotation_interval,
                settings.bucket_refresh_interval,
                settings.peer_expiry,
            );
        }

        if last_bootstrap.elapsed() >= settings.bootstrap_interval {
            last_bootstrap = Instant::now();

            let table_size = rpc.route().size();
            if table_size < settings.min_nodes {
                debug!(table_size, "Populating the routing table");
                rpc.find_node(id);
            }
        }
    }

    debug!(?id, "Dht actor stopped");
}

fn handle_actor_message(rpc: &mut Rpc<KrpcSocket>, message: ActorMessage) {
    match message {
        ActorMessage::Datagram(from, bytes) => rpc.handle_message(from, &bytes),
        ActorMessage::Info(sender) => {
            let _ = sender.send(Info::from(&*rpc));
        }
        ActorMessage::FindNode(target) => rpc.find_node(target),
        ActorMessage::Ping(address) => rpc.ping(address),
        ActorMessage::Search {
            kind,
            target,
            callback,
            result,
        } => {
            let outcome = match kind {
                SearchKind::Peers => rpc.search(target, callback),
                SearchKind::Closest => rpc.find_closest(target, callback),
                SearchKind::Announce(port) => rpc.announce_peer(target, port, callback),
            };

            let _ = result.send(outcome);
        }
        ActorMessage::Shutdown(_) => {}
    }
}

fn read_loop(socket: UdpSocket, sender: WeakSender<ActorMessage>, packet_size: usize) {
    let mut buf = vec![0u8; packet_size];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let Some(sender) = sender.upgrade() else {
                    break;
                };

                let datagram = Bytes::copy_from_slice(&buf[..amt]);

                match sender.try_send(ActorMessage::Datagram(from, datagram)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(context = "socket_error", ?from, "Inbound queue full, dropping datagram");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok((_, SocketAddr::V6(_))) => {}
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if sender
                    .upgrade()
                    .map_or(true, |sender| sender.is_disconnected())
                {
                    break;
                }
            }
            Err(error) => {
                error!(?error, "Dht socket reader failed");
                break;
            }
        }
    }
}

fn resolve(bootstrap: &[String]) -> Vec<SocketAddrV4> {
    bootstrap
        .iter()
        .filter_map(|host| match host.to_socket_addrs() {
            Ok(addresses) => Some(addresses),
            Err(error) => {
                debug!(?host, ?error, "Could not resolve bootstrapping node");
                None
            }
        })
        .flatten()
        .filter_map(|address| match address {
            SocketAddr::V4(address) => Some(address),
            SocketAddr::V6(_) => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchKind {
    Peers,
    Closest,
    Announce(Option<u16>),
}

pub(crate) enum ActorMessage {
    Datagram(SocketAddrV4, Bytes),
    Info(Sender<Info>),
    FindNode(Id),
    Ping(SocketAddrV4),
    Search {
        kind: SearchKind,
        target: Id,
        callback: SearchCallback,
        result: Sender<Result<(), SearchError>>,
    },
    Shutdown(Sender<()>),
}

impl std::fmt::Debug for ActorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorMessage::Datagram(from, bytes) => write!(f, "Datagram({from}, {} bytes)", bytes.len()),
            ActorMessage::Info(_) => write!(f, "Info"),
            ActorMessage::FindNode(target) => write!(f, "FindNode({target})"),
            ActorMessage::Ping(address) => write!(f, "Ping({address})"),
            ActorMessage::Search { kind, target, .. } => write!(f, "Search({kind:?}, {target})"),
            ActorMessage::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Dht is shutdown")]
/// The actor thread of this [Dht] is gone.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug)]
/// Errors starting a search through a [Dht] handle.
pub enum DhtSearchError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}

#[cfg(test)]
mod test {
    use super::*;

    fn testnet_node(bootstrap: &[String]) -> Dht {
        Dht::builder()
            .bootstrap(bootstrap)
            .maintenance_interval(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    #[test]
    fn shutdown() {
        let dht = testnet_node(&[]);

        let clone = dht.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        });

        dht.shutdown();

        assert!(matches!(dht.info(), Err(DhtWasShutdown)));
    }

    #[test]
    fn info() {
        let id = Id::random();
        let dht = Dht::builder().id(id).bootstrap(&[]).build().unwrap();

        let info = dht.info().unwrap();

        assert_eq!(info.id(), &id);
        assert_eq!(info.nodes(), 0);
        assert_eq!(info.buckets(), 1);
        assert_ne!(info.local_addr().port(), 0);
    }

    #[test]
    fn empty_table_search_ends() {
        let dht = testnet_node(&[]);

        assert_eq!(dht.get_peers(Id::random()).unwrap().count(), 0);
        assert!(dht.find_closest(Id::random()).is_ok());
    }
}
