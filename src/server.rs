//! Answer incoming queries from the local routing table and peers store.

pub mod peers;
pub mod tokens;

use std::net::SocketAddrV4;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use crate::common::{
    AnnouncePeerRequestArguments, ErrorSpecific, FindNodeRequestArguments,
    GetPeersRequestArguments, MessageType, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific, RoutingTable, DEFAULT_K,
};

use peers::PeersStore;
use tokens::Tokens;

/// Default maximum number of info hashes to store peers for.
pub const MAX_INFO_HASHES: usize = 102_400;
/// Default maximum number of peers to store per info hash.
pub const MAX_PEERS: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// The maximum info_hashes for which to store peers.
    ///
    /// Defaults to [MAX_INFO_HASHES]
    pub max_info_hashes: usize,
    /// The maximum peers to store per info_hash.
    ///
    /// Defaults to [MAX_PEERS]
    pub max_peers_per_info_hash: usize,
    /// The maximum number of peers included in a single `get_peers` reply.
    ///
    /// Defaults to [DEFAULT_K]
    pub max_values_per_reply: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_info_hashes: MAX_INFO_HASHES,
            max_peers_per_info_hash: MAX_PEERS,
            max_values_per_reply: DEFAULT_K,
        }
    }
}

#[derive(Debug)]
/// Handles incoming requests.
///
/// Supports [BEP0005](https://www.bittorrent.org/beps/bep_0005.html),
/// but doesn't implement any rate-limiting or blocking.
pub struct Server {
    /// Tokens generator
    pub tokens: Tokens,
    /// Peers store
    pub peers: PeersStore,
    rng: StdRng,
    max_values_per_reply: usize,
}

impl Server {
    /// Create a new server, deriving its randomness from `rng`.
    pub fn new<R: Rng + ?Sized>(settings: &ServerSettings, rng: &mut R) -> Self {
        Self {
            tokens: Tokens::from_rng(StdRng::seed_from_u64(rng.gen())),
            peers: PeersStore::new(settings.max_info_hashes, settings.max_peers_per_info_hash),
            rng: StdRng::seed_from_u64(rng.gen()),
            max_values_per_reply: settings.max_values_per_reply,
        }
    }

    /// Build the reply to a request from `from`.
    ///
    /// Runs on the node's single event loop, so it has to stay cheap.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        from: SocketAddrV4,
        request: &RequestSpecific,
    ) -> MessageType {
        let responder_id = *routing_table.id();
        let requester_id = request.requester_id;

        match &request.request_type {
            RequestTypeSpecific::Ping => {
                MessageType::Response(ResponseSpecific::new(responder_id))
            }
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                MessageType::Response(ResponseSpecific {
                    nodes: Some(routing_table.lookup(target)),
                    ..ResponseSpecific::new(responder_id)
                })
            }
            RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }) => {
                let token = Some(self.tokens.generate_token(from).to_vec());

                MessageType::Response(
                    match self.peers.get_random_peers(
                        info_hash,
                        self.max_values_per_reply,
                        &mut self.rng,
                    ) {
                        Some(peers) => ResponseSpecific {
                            token,
                            values: Some(peers),
                            ..ResponseSpecific::new(responder_id)
                        },
                        None => ResponseSpecific {
                            token,
                            nodes: Some(routing_table.lookup(info_hash)),
                            ..ResponseSpecific::new(responder_id)
                        },
                    },
                )
            }
            RequestTypeSpecific::AnnouncePeer(arguments) => {
                if !self.tokens.validate(from, &arguments.token) {
                    debug!(
                        info_hash = ?arguments.info_hash,
                        ?requester_id,
                        ?from,
                        request_type = "announce_peer",
                        "Invalid token"
                    );

                    return MessageType::Error(ErrorSpecific {
                        code: 203,
                        description: "Bad token".to_string(),
                    });
                }

                let peer = announced_peer(from, arguments);

                if let Err(error) = self.peers.store(arguments.info_hash, peer) {
                    debug!(
                        info_hash = ?arguments.info_hash,
                        ?requester_id,
                        ?peer,
                        ?error,
                        "Announced peer not stored"
                    );
                }

                MessageType::Response(ResponseSpecific::new(responder_id))
            }
        }
    }
}

/// The peer address an `announce_peer` request asks to store.
pub fn announced_peer(from: SocketAddrV4, arguments: &AnnouncePeerRequestArguments) -> SocketAddrV4 {
    if arguments.implied_port {
        from
    } else {
        SocketAddrV4::new(*from.ip(), arguments.port)
    }
}

#[cfg(test)]
mod test {
    use crate::common::Id;

    use super::*;

    fn server() -> Server {
        Server::new(&ServerSettings::default(), &mut rand::thread_rng())
    }

    fn request(request_type: RequestTypeSpecific) -> RequestSpecific {
        RequestSpecific {
            requester_id: Id::random(),
            request_type,
        }
    }

    #[test]
    fn ping() {
        let mut server = server();
        let table = RoutingTable::new(Id::random());
        let from = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);

        let reply = server.handle_request(&table, from, &request(RequestTypeSpecific::Ping));

        assert_eq!(
            reply,
            MessageType::Response(ResponseSpecific::new(*table.id()))
        );
    }

    #[test]
    fn get_peers_then_announce() {
        let mut server = server();
        let table = RoutingTable::new(Id::random());
        let from = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let info_hash = Id::random();

        let token = match server.handle_request(
            &table,
            from,
            &request(RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                info_hash,
            })),
        ) {
            MessageType::Response(ResponseSpecific {
                token: Some(token),
                values: None,
                ..
            }) => token,
            other => panic!("unexpected reply {:?}", other),
        };

        let reply = server.handle_request(
            &table,
            from,
            &request(RequestTypeSpecific::AnnouncePeer(
                AnnouncePeerRequestArguments {
                    info_hash,
                    port: 1234,
                    token,
                    implied_port: false,
                },
            )),
        );

        assert!(matches!(reply, MessageType::Response(_)));
        assert_eq!(
            server.peers.get_peers(&info_hash),
            vec![SocketAddrV4::new([127, 0, 0, 1].into(), 1234)]
        );
    }

    #[test]
    fn bad_token() {
        let mut server = server();
        let table = RoutingTable::new(Id::random());
        let from = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let info_hash = Id::random();

        let reply = server.handle_request(
            &table,
            from,
            &request(RequestTypeSpecific::AnnouncePeer(
                AnnouncePeerRequestArguments {
                    info_hash,
                    port: 1234,
                    token: vec![0; 20],
                    implied_port: false,
                },
            )),
        );

        assert!(matches!(reply, MessageType::Error(ErrorSpecific { code: 203, .. })));
        assert!(server.peers.is_empty());
    }

    #[test]
    fn implied_port() {
        let from = SocketAddrV4::new([10, 0, 0, 1].into(), 4000);
        let mut arguments = AnnouncePeerRequestArguments {
            info_hash: Id::random(),
            port: 1234,
            token: vec![],
            implied_port: true,
        };

        assert_eq!(announced_peer(from, &arguments), from);

        arguments.implied_port = false;
        assert_eq!(
            announced_peer(from, &arguments),
            SocketAddrV4::new([10, 0, 0, 1].into(), 1234)
        );
    }
}
