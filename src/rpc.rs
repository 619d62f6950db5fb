//! K-RPC node: dispatch of incoming messages, searches and routing table maintenance.
//!
//! An [Rpc] owns all the mutable state of a node and is driven by a single caller,
//! see [crate::Dht] for the threaded driver.

pub mod config;
mod info;
pub mod observer;
pub mod search;
pub mod socket;

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, trace};

use crate::common::{
    decode_transaction_id, encode_transaction_id, AnnouncePeerRequestArguments, ErrorSpecific,
    FindNodeRequestArguments, GetPeersRequestArguments, Id, Message, MessageType, Method,
    RequestSpecific, RequestTypeSpecific, ResponseSpecific, RoutingTable,
};
use crate::server::{announced_peer, Server};

pub use config::Config;
pub use info::Info;
pub use observer::{ErrorObserver, NoopObserver, Observer, QueryObserver, ReplyObserver};
pub use search::{Acknowledgement, Search, SearchCallback, SearchError, Searches};
pub use socket::{send_datagram, KrpcSocket, Transport};

/// Client version sent with every message, "KN" version 01.
pub const VERSION: [u8; 4] = [75, 78, 0, 1];

#[derive(Debug)]
/// A single Dht node, generic over the transport it sends datagrams through.
pub struct Rpc<T: Transport> {
    id: Id,
    transport: T,
    routing_table: RoutingTable,
    searches: Searches,
    server: Server,
    observer: Box<dyn Observer>,
    rng: StdRng,

    max_candidates: usize,
    search_timeout: Duration,
}

impl<T: Transport> Rpc<T> {
    /// Create a node with identifier `id` sending through `transport`.
    pub fn new(id: Id, transport: T, mut config: Config) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let server = Server::new(&config.server_settings(), &mut rng);
        let observer = config
            .observer
            .take()
            .unwrap_or_else(|| Box::new(NoopObserver));

        Rpc {
            id,
            transport,
            routing_table: RoutingTable::with_k(id, config.k),
            searches: Searches::new(),
            server,
            observer,
            rng,

            max_candidates: 2 * config.k,
            search_timeout: config.search_timeout,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.transport.local_addr()
    }

    /// The routing table, for introspection.
    pub fn route(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Tokens and peers store answering incoming queries.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Number of searches in progress.
    pub fn searches_count(&self) -> usize {
        self.searches.len()
    }

    // === Public Methods ===

    /// Handle a datagram received from `from`.
    ///
    /// Malformed datagrams are dropped.
    pub fn handle_message(&mut self, from: SocketAddrV4, bytes: &[u8]) {
        if from.port() == 0 {
            trace!(context = "socket_validation", ?from, "Message from port 0");
            return;
        }

        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );
                return;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        let Message {
            transaction_id,
            message_type,
            ..
        } = message;

        match message_type {
            MessageType::Request(request) => self.handle_request(from, transaction_id, &request),
            MessageType::Response(response) => {
                self.handle_response(from, &transaction_id, &response)
            }
            MessageType::Error(error) => {
                debug!(?from, ?error, "RPC Error response");
                self.observer.error(from, &error);
            }
        }
    }

    /// Ask the nodes closest to `target` in our table for nodes closer to it,
    /// without tracking the replies beyond adding them to the routing table.
    pub fn find_node(&mut self, target: Id) {
        for node in self.routing_table.lookup(&target) {
            self.request(
                node.address,
                None,
                RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            );
        }
    }

    /// Send a single `find_node` query to `address`, used to bootstrap.
    pub fn find_node_from(&mut self, target: Id, address: SocketAddrV4) {
        self.request(
            address,
            None,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
        );
    }

    pub fn ping(&mut self, address: SocketAddrV4) {
        self.request(address, None, RequestTypeSpecific::Ping);
    }

    /// Look for peers announced under `info_hash`.
    ///
    /// `callback` receives every peer found, starting with the peers stored locally,
    /// and a final `None` once the search is done.
    pub fn search(&mut self, info_hash: Id, callback: SearchCallback) -> Result<(), SearchError> {
        self.start_search(Search::new(
            info_hash,
            Method::GetPeers,
            self.max_candidates,
            callback,
        ))
    }

    /// Iteratively look up the nodes closest to `target`, filling the routing table.
    ///
    /// `callback` only receives the final `None`.
    pub fn find_closest(&mut self, target: Id, callback: SearchCallback) -> Result<(), SearchError> {
        self.start_search(Search::new(
            target,
            Method::FindNode,
            self.max_candidates,
            callback,
        ))
    }

    /// Search for peers of `info_hash`, then announce ourselves as a peer to every
    /// node that replied with a token.
    ///
    /// `port` of `None` asks the remote nodes to use our UDP source port.
    pub fn announce_peer(
        &mut self,
        info_hash: Id,
        port: Option<u16>,
        callback: SearchCallback,
    ) -> Result<(), SearchError> {
        self.start_search(
            Search::new(info_hash, Method::GetPeers, self.max_candidates, callback)
                .with_announce(port),
        )
    }

    /// Periodic housekeeping, to be called by the driver's own timer.
    ///
    /// - Rotate the token secret if older than `secret_interval`.
    /// - Refresh buckets untouched for `bucket_stale_interval`, and ping or evict
    ///   quiet nodes in the other buckets.
    /// - Forget peers announced more than `peer_expiry` ago.
    /// - Complete searches that stopped making progress.
    pub fn do_maintenance(
        &mut self,
        secret_interval: Duration,
        bucket_stale_interval: Duration,
        peer_expiry: Duration,
    ) {
        if self.server.tokens.should_update(secret_interval) {
            self.server.tokens.rotate();
        }

        let now = Instant::now();
        let rng = &mut self.rng;

        let mut refresh = vec![];
        let mut pings = vec![];
        let mut evicted = 0;

        self.routing_table.for_each_bucket_mut(|depth, bucket| {
            if !bucket.is_fresh(now, bucket_stale_interval) {
                if let Some(address) = bucket.pick_random(rng).map(|node| node.address) {
                    refresh.push((bucket.random_id(depth, rng), address));
                }
                return;
            }

            evicted += bucket.sweep(|node| {
                if node.is_unresponsive() {
                    return true;
                }

                if !node.is_good(now, bucket_stale_interval) {
                    node.failed_ping();
                    pings.push(node.address);
                }

                false
            });
        });

        if evicted > 0 {
            debug!(evicted, "Removed unresponsive nodes from the routing table");
        }

        for (target, address) in refresh {
            self.find_node_from(target, address);
        }
        for address in pings {
            self.ping(address);
        }

        let expired = self.server.peers.sweep(peer_expiry);
        if expired > 0 {
            debug!(expired, "Removed expired peers");
        }

        for sequence in self.searches.done(now, self.search_timeout) {
            if let Some(search) = self.searches.remove(sequence) {
                self.finish(search);
            }
        }
    }

    // === Private Methods ===

    fn handle_request(&mut self, from: SocketAddrV4, transaction_id: Vec<u8>, request: &RequestSpecific) {
        self.add_node(request.requester_id, from);

        let message_type = self
            .server
            .handle_request(&self.routing_table, from, request);

        self.send(
            from,
            Message {
                transaction_id,
                version: Some(VERSION.to_vec()),
                message_type,
            },
        );

        let requester_id = &request.requester_id;

        match &request.request_type {
            RequestTypeSpecific::Ping => self.observer.query_ping(requester_id),
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                self.observer.query_find_node(requester_id, target)
            }
            RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }) => {
                self.observer.query_get_peers(requester_id, info_hash)
            }
            RequestTypeSpecific::AnnouncePeer(arguments) => self.observer.query_announce_peer(
                requester_id,
                &arguments.info_hash,
                announced_peer(from, arguments),
            ),
        }
    }

    fn handle_response(&mut self, from: SocketAddrV4, transaction_id: &[u8], response: &ResponseSpecific) {
        self.add_node(response.responder_id, from);

        let nodes = response.nodes.as_deref().unwrap_or_default();
        let values = response.values.as_deref().unwrap_or_default();

        for node in nodes {
            if node.id != self.id && node.address.port() != 0 {
                let _ = self.routing_table.insert(node.id, node.address);
            }
        }

        let (method, sequence) = decode_transaction_id(transaction_id);

        if let (Some(method), Some(sequence)) = (method, sequence) {
            self.absorb(method, sequence, from, response);
        }

        let responder_id = &response.responder_id;

        match method {
            Some(Method::Ping) => self.observer.reply_ping(responder_id),
            Some(Method::FindNode) => self.observer.reply_find_node(responder_id, nodes),
            Some(Method::GetPeers) => self.observer.reply_get_peers(responder_id, values, nodes),
            Some(Method::AnnouncePeer) => self.observer.reply_announce_peer(responder_id),
            None => {
                trace!(context = "uncorrelated_reply", ?from, ?transaction_id);
            }
        }
    }

    /// Feed a reply into the search it answers.
    fn absorb(
        &mut self,
        method: Method,
        sequence: u16,
        from: SocketAddrV4,
        response: &ResponseSpecific,
    ) {
        let Some(search) = self.searches.get_mut(sequence) else {
            trace!(context = "search", sequence, ?from, "Reply for a closed search");
            return;
        };

        if search.method() != method {
            trace!(
                context = "search",
                sequence,
                ?from,
                method = method.name(),
                "Reply for another search under a reused sequence"
            );
            return;
        }

        match search.acknowledge(&response.responder_id, response.token.clone()) {
            Acknowledgement::First => {}
            Acknowledgement::Repeated => {
                trace!(context = "search", sequence, ?from, "Repeated reply");
                return;
            }
            Acknowledgement::Unknown => {
                trace!(context = "search", sequence, ?from, "Reply from a node we didn't query");
                return;
            }
        }

        if search.method() == Method::GetPeers {
            for peer in response.values.iter().flatten() {
                if let Err(error) = self.server.peers.store(*search.target(), *peer) {
                    debug!(info_hash = ?search.target(), ?peer, ?error, "Found peer not stored");
                }
                search.notify(Some(*peer));
            }
        }

        for node in response.nodes.iter().flatten() {
            if node.id != self.id && node.address.port() != 0 {
                search.insert(node.id, node.address);
            }
        }

        self.fan_out(sequence);

        let done = self
            .searches
            .get(sequence)
            .is_some_and(|search| search.is_done(Instant::now(), None));

        if done {
            if let Some(search) = self.searches.remove(sequence) {
                self.finish(search);
            }
        }
    }

    fn start_search(&mut self, mut search: Search) -> Result<(), SearchError> {
        let target = *search.target();

        if self.searches.find(&target, search.method()).is_some() {
            return Err(SearchError::InProgress);
        }

        let sequence = self.searches.next_sequence()?;

        if search.method() == Method::GetPeers {
            for peer in self.server.peers.get_peers(&target) {
                search.notify(Some(peer));
            }
        }

        for node in self.routing_table.lookup(&target) {
            search.insert(node.id, node.address);
        }

        if search.is_empty() {
            debug!(?target, method = search.method().name(), "No nodes to search");
            search.notify(None);
            return Ok(());
        }

        self.searches.insert(sequence, search);
        self.fan_out(sequence);

        Ok(())
    }

    /// Query every candidate of a search that wasn't queried yet.
    fn fan_out(&mut self, sequence: u16) {
        let Some(search) = self.searches.get_mut(sequence) else {
            return;
        };

        let target = *search.target();
        let pending = search.pending();

        for (id, _) in &pending {
            search.queried(id);
        }

        let request_type = match search.method() {
            Method::FindNode => RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            _ => RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash: target }),
        };

        for (_, address) in pending {
            self.request(address, Some(sequence), request_type.clone());
        }
    }

    fn finish(&mut self, mut search: Search) {
        let target = *search.target();

        if let Some(port) = search.announce() {
            let announces: Vec<_> = search
                .candidates()
                .iter()
                .filter(|candidate| candidate.acked)
                .filter_map(|candidate| {
                    candidate
                        .token
                        .clone()
                        .map(|token| (candidate.address, token))
                })
                .collect();

            debug!(?target, announces = announces.len(), "Announcing peer");

            for (address, token) in announces {
                self.request(
                    address,
                    None,
                    RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                        info_hash: target,
                        port: port.unwrap_or(0),
                        token,
                        implied_port: port.is_none(),
                    }),
                );
            }
        }

        debug!(
            ?target,
            method = search.method().name(),
            candidates = search.len(),
            "Search done"
        );

        search.notify(None);
    }

    fn add_node(&mut self, id: Id, from: SocketAddrV4) {
        if let Err(error) = self.routing_table.insert(id, from) {
            trace!(context = "routing_table", ?id, ?from, %error, "Node not added");
        }
    }

    fn request(&mut self, address: SocketAddrV4, sequence: Option<u16>, request_type: RequestTypeSpecific) {
        let transaction_id = encode_transaction_id(request_type.method(), sequence);

        self.send(
            address,
            Message {
                transaction_id: transaction_id.to_vec(),
                version: Some(VERSION.to_vec()),
                message_type: MessageType::Request(RequestSpecific {
                    requester_id: self.id,
                    request_type,
                }),
            },
        );
    }

    fn send(&mut self, address: SocketAddrV4, message: Message) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(context = "socket_error", ?error, ?message, "Could not encode message");
                return;
            }
        };

        if let Err(error) = send_datagram(&mut self.transport, &bytes, address) {
            debug!(context = "socket_error", ?error, ?address, "Error sending message");
        }

        trace!(context = "socket_message_sending", ?message, ?address);
    }
}

/// An error reply, in case a driver wants to answer something the [Server] doesn't.
pub fn error_message(transaction_id: Vec<u8>, code: i32, description: &str) -> Message {
    Message {
        transaction_id,
        version: Some(VERSION.to_vec()),
        message_type: MessageType::Error(ErrorSpecific {
            code,
            description: description.to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::common::MAX_FAILED_PINGS;

    #[derive(Debug, Default)]
    struct Recorder {
        sent: Vec<(SocketAddrV4, Message)>,
    }

    impl Transport for Recorder {
        fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<usize> {
            self.sent
                .push((address, Message::from_bytes(bytes).expect("valid message")));
            Ok(bytes.len())
        }

        fn local_addr(&self) -> SocketAddrV4 {
            SocketAddrV4::new([127, 0, 0, 1].into(), 6881)
        }
    }

    fn rpc() -> Rpc<Recorder> {
        Rpc::new(
            Id::random(),
            Recorder::default(),
            Config {
                seed: Some(42),
                ..Default::default()
            },
        )
    }

    fn address(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, 1].into(), port)
    }

    fn query(id: Id, request_type: RequestTypeSpecific) -> Vec<u8> {
        Message {
            transaction_id: vec![1, 2],
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: id,
                request_type,
            }),
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn ping_reply_echoes_transaction_id() {
        let mut rpc = rpc();
        let id = Id::random();

        rpc.handle_message(address(1000), &query(id, RequestTypeSpecific::Ping));

        let (to, reply) = &rpc.transport().sent[0];
        assert_eq!(*to, address(1000));
        assert_eq!(reply.transaction_id, vec![1, 2]);
        assert_eq!(reply.version, Some(VERSION.to_vec()));
        assert_eq!(
            reply.message_type,
            MessageType::Response(ResponseSpecific::new(*rpc.id()))
        );

        assert!(rpc.route().contains(&id));
    }

    #[test]
    fn ignore_port_zero_and_garbage() {
        let mut rpc = rpc();

        rpc.handle_message(address(0), &query(Id::random(), RequestTypeSpecific::Ping));
        rpc.handle_message(address(1000), b"not bencode");

        assert!(rpc.transport().sent.is_empty());
        assert!(rpc.route().is_empty());
    }

    #[test]
    fn search_without_nodes_finishes_immediately() {
        let mut rpc = rpc();
        let calls = Arc::new(Mutex::new(vec![]));
        let cloned = calls.clone();

        rpc.search(
            Id::random(),
            Box::new(move |peer| cloned.lock().unwrap().push(peer)),
        )
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![None]);
        assert_eq!(rpc.searches_count(), 0);
    }

    #[test]
    fn duplicate_search() {
        let mut rpc = rpc();
        rpc.handle_message(address(1000), &query(Id::random(), RequestTypeSpecific::Ping));

        let target = Id::random();

        rpc.search(target, Box::new(|_| {})).unwrap();
        assert_eq!(
            rpc.search(target, Box::new(|_| {})),
            Err(SearchError::InProgress)
        );
        assert!(rpc.find_closest(target, Box::new(|_| {})).is_ok());
        assert_eq!(rpc.searches_count(), 2);
    }

    #[test]
    fn maintenance_sweeps_searches() {
        let mut rpc = Rpc::new(
            Id::random(),
            Recorder::default(),
            Config {
                search_timeout: Duration::ZERO,
                ..Default::default()
            },
        );
        rpc.handle_message(address(1000), &query(Id::random(), RequestTypeSpecific::Ping));

        let calls = Arc::new(Mutex::new(vec![]));
        let cloned = calls.clone();

        rpc.search(
            Id::random(),
            Box::new(move |peer| cloned.lock().unwrap().push(peer)),
        )
        .unwrap();
        assert_eq!(rpc.searches_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        rpc.do_maintenance(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        assert_eq!(rpc.searches_count(), 0);
        assert_eq!(*calls.lock().unwrap(), vec![None]);
    }

    #[test]
    fn maintenance_refreshes_stale_buckets() {
        let mut rpc = rpc();
        let id = Id::random();
        rpc.handle_message(address(1000), &query(id, RequestTypeSpecific::Ping));
        rpc.transport_mut().sent.clear();

        std::thread::sleep(Duration::from_millis(5));
        rpc.do_maintenance(
            Duration::from_secs(60),
            Duration::from_millis(1),
            Duration::from_secs(60),
        );

        let (to, message) = &rpc.transport().sent[0];
        assert_eq!(*to, address(1000));
        assert!(matches!(
            &message.message_type,
            MessageType::Request(RequestSpecific {
                request_type: RequestTypeSpecific::FindNode(_),
                ..
            })
        ));
        assert_eq!(
            decode_transaction_id(&message.transaction_id),
            (Some(Method::FindNode), None)
        );
    }

    #[test]
    fn maintenance_evicts_silent_nodes() {
        let mut rpc = rpc();
        let interval = Duration::from_millis(50);

        let silent = Id::random();
        let active = Id::random();

        rpc.handle_message(address(1000), &query(silent, RequestTypeSpecific::Ping));
        std::thread::sleep(interval * 2);

        for tick in 0..=MAX_FAILED_PINGS {
            // Keeps the bucket fresh, so its quiet nodes get pinged instead of refreshed.
            rpc.handle_message(address(2000), &query(active, RequestTypeSpecific::Ping));
            rpc.transport_mut().sent.clear();

            rpc.do_maintenance(Duration::from_secs(60), interval, Duration::from_secs(60));

            let pings: Vec<_> = rpc
                .transport()
                .sent
                .iter()
                .filter(|(_, message)| {
                    decode_transaction_id(&message.transaction_id) == (Some(Method::Ping), None)
                })
                .map(|(to, _)| *to)
                .collect();

            assert!(rpc.route().contains(&active));

            if tick < MAX_FAILED_PINGS {
                assert_eq!(pings, vec![address(1000)]);
                assert_eq!(
                    rpc.route().get(&silent).map(|node| node.pinged),
                    Some(tick + 1)
                );
            } else {
                assert!(pings.is_empty());
                assert!(!rpc.route().contains(&silent));
            }
        }
    }

    #[test]
    fn maintenance_expires_peers() {
        let mut rpc = rpc();
        let info_hash = Id::random();

        rpc.server.peers.store(info_hash, address(1)).unwrap();

        rpc.do_maintenance(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert_eq!(rpc.server().peers.peers_count(&info_hash), 1);

        std::thread::sleep(Duration::from_millis(5));
        rpc.do_maintenance(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_millis(1),
        );
        assert!(rpc.server().peers.is_empty());
    }

    #[test]
    fn error_message_layout() {
        let message = error_message(vec![1], 201, "Generic Error");

        assert_eq!(
            message.message_type,
            MessageType::Error(ErrorSpecific {
                code: 201,
                description: "Generic Error".to_string()
            })
        );
    }
}
