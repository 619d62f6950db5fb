//! Serialize and deserialize KRPC messages.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use serde_bytes::ByteBuf;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// Size of a compact node record: 20 bytes Id, 4 bytes IPv4, 2 bytes port.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + COMPACT_PEER_SIZE;
/// Size of a compact peer record: 4 bytes IPv4, 2 bytes port.
pub const COMPACT_PEER_SIZE: usize = 6;

/// Sequence number reserved for queries that belong to no search.
pub const NO_SEARCH: u16 = 0xFFFF;

/// Transaction id size of the queries we send.
pub const TRANSACTION_ID_SIZE: usize = 4;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Opaque correlator, echoed back in replies.
    pub transaction_id: Vec<u8>,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetPeers(GetPeersRequestArguments),
    AnnouncePeer(AnnouncePeerRequestArguments),
}

impl RequestTypeSpecific {
    pub fn method(&self) -> Method {
        match self {
            RequestTypeSpecific::Ping => Method::Ping,
            RequestTypeSpecific::FindNode(_) => Method::FindNode,
            RequestTypeSpecific::GetPeers(_) => Method::GetPeers,
            RequestTypeSpecific::AnnouncePeer(_) => Method::AnnouncePeer,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct AnnouncePeerRequestArguments {
    pub info_hash: Id,
    pub port: u16,
    pub token: Vec<u8>,
    /// Use the UDP source port instead of `port`.
    pub implied_port: bool,
}

/// Reply arguments, which fields are set depends on the method being answered.
#[derive(Debug, PartialEq, Clone)]
pub struct ResponseSpecific {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub nodes: Option<Vec<Node>>,
    pub values: Option<Vec<SocketAddrV4>>,
}

impl ResponseSpecific {
    /// Bare reply, as sent for `ping` and `announce_peer`.
    pub fn new(responder_id: Id) -> Self {
        ResponseSpecific {
            responder_id,
            token: None,
            nodes: None,
            values: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
/// Query methods, as tagged in the first two bytes of our transaction ids.
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl Method {
    pub fn tag(&self) -> [u8; 2] {
        match self {
            Method::Ping => *b"pn",
            Method::FindNode => *b"fn",
            Method::GetPeers => *b"gp",
            Method::AnnouncePeer => *b"ap",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Method> {
        match tag {
            b"pn" => Some(Method::Ping),
            b"fn" => Some(Method::FindNode),
            b"gp" => Some(Method::GetPeers),
            b"ap" => Some(Method::AnnouncePeer),
            _ => None,
        }
    }

    /// Method name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::GetPeers => "get_peers",
            Method::AnnouncePeer => "announce_peer",
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id,
            version: self.version.map(ByteBuf::from),
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    request_type,
                }) => internal::DHTMessageVariant::Request(match request_type {
                    RequestTypeSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingRequestArguments {
                            id: *requester_id.as_bytes(),
                        },
                    },
                    RequestTypeSpecific::FindNode(find_node_args) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: *requester_id.as_bytes(),
                                target: *find_node_args.target.as_bytes(),
                            },
                        }
                    }
                    RequestTypeSpecific::GetPeers(get_peers_args) => {
                        internal::DHTRequestSpecific::GetPeers {
                            arguments: internal::DHTGetPeersRequestArguments {
                                id: *requester_id.as_bytes(),
                                info_hash: *get_peers_args.info_hash.as_bytes(),
                            },
                        }
                    }
                    RequestTypeSpecific::AnnouncePeer(announce_peer_args) => {
                        internal::DHTRequestSpecific::AnnouncePeer {
                            arguments: internal::DHTAnnouncePeerRequestArguments {
                                id: *requester_id.as_bytes(),
                                info_hash: *announce_peer_args.info_hash.as_bytes(),
                                port: announce_peer_args.port,
                                token: announce_peer_args.token,
                                implied_port: announce_peer_args.implied_port.then_some(1),
                            },
                        }
                    }
                }),

                MessageType::Response(res) => {
                    internal::DHTMessageVariant::Response(internal::DHTResponseSpecific {
                        arguments: internal::DHTResponseArguments {
                            id: *res.responder_id.as_bytes(),
                            token: res.token.map(ByteBuf::from),
                            nodes: res.nodes.map(|nodes| ByteBuf::from(encode_nodes(&nodes))),
                            values: res.values.map(|peers| {
                                peers
                                    .iter()
                                    .map(|peer| ByteBuf::from(encode_peer(peer).to_vec()))
                                    .collect()
                            }),
                        },
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        if msg.transaction_id.is_empty() {
            return Err(Error::InvalidTransactionId(msg.transaction_id));
        }

        Ok(Message {
            transaction_id: msg.transaction_id,
            version: msg.version.map(ByteBuf::into_vec),
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DHTRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::DHTRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from(arguments.target),
                            }),
                        },
                        internal::DHTRequestSpecific::GetPeers { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                                info_hash: Id::from(arguments.info_hash),
                            }),
                        },
                        internal::DHTRequestSpecific::AnnouncePeer { arguments } => {
                            RequestSpecific {
                                requester_id: Id::from(arguments.id),
                                request_type: RequestTypeSpecific::AnnouncePeer(
                                    AnnouncePeerRequestArguments {
                                        info_hash: Id::from(arguments.info_hash),
                                        port: arguments.port,
                                        token: arguments.token,
                                        implied_port: arguments
                                            .implied_port
                                            .is_some_and(|implied_port| implied_port != 0),
                                    },
                                ),
                            }
                        }
                    })
                }

                internal::DHTMessageVariant::Response(internal::DHTResponseSpecific {
                    arguments,
                }) => MessageType::Response(ResponseSpecific {
                    responder_id: Id::from(arguments.id),
                    token: arguments.token.map(ByteBuf::into_vec),
                    nodes: arguments.nodes.map(|nodes| decode_nodes(&nodes)),
                    values: arguments.values.map(|values| {
                        values
                            .iter()
                            .flat_map(|value| decode_peers(value))
                            .collect()
                    }),
                }),

                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes)?)
    }

    /// Return the Id of the sender of the Message, error messages carry none.
    pub fn get_author_id(&self) -> Option<Id> {
        match &self.message_type {
            MessageType::Request(arguments) => Some(arguments.requester_id),
            MessageType::Response(arguments) => Some(arguments.responder_id),
            MessageType::Error(_) => None,
        }
    }

    /// If the response contains closer nodes to the target, return them.
    pub fn get_closer_nodes(&self) -> Option<&[Node]> {
        match &self.message_type {
            MessageType::Response(arguments) => arguments.nodes.as_deref(),
            _ => None,
        }
    }

    pub fn get_token(&self) -> Option<&[u8]> {
        match &self.message_type {
            MessageType::Response(arguments) => arguments.token.as_deref(),
            _ => None,
        }
    }
}

// === Transaction ids ===

/// Encode the transaction id of an outgoing query.
///
/// `None` (or [NO_SEARCH]) marks a query that belongs to no search.
pub fn encode_transaction_id(method: Method, sequence: Option<u16>) -> [u8; TRANSACTION_ID_SIZE] {
    let [a, b] = method.tag();
    let [c, d] = sequence.unwrap_or(NO_SEARCH).to_be_bytes();

    [a, b, c, d]
}

/// Decode the method and search sequence from a transaction id we issued.
///
/// Never fails, anything we don't recognize is simply `None`.
pub fn decode_transaction_id(bytes: &[u8]) -> (Option<Method>, Option<u16>) {
    if bytes.len() != TRANSACTION_ID_SIZE {
        return (None, None);
    }

    let Some(method) = Method::from_tag(&bytes[..2]) else {
        return (None, None);
    };
    let sequence = u16::from_be_bytes([bytes[2], bytes[3]]);

    (Some(method), (sequence != NO_SEARCH).then_some(sequence))
}

// === Compact encodings ===

pub fn encode_peer(address: &SocketAddrV4) -> [u8; COMPACT_PEER_SIZE] {
    let [a, b, c, d] = address.ip().octets();
    let [e, f] = address.port().to_be_bytes();

    [a, b, c, d, e, f]
}

/// Decode a single compact peer, `None` unless exactly 6 bytes.
pub fn decode_peer(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() != COMPACT_PEER_SIZE {
        return None;
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Some(SocketAddrV4::new(ip, port))
}

pub fn encode_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    peers.iter().flat_map(encode_peer).collect()
}

/// Decode concatenated compact peers, ignoring a truncated tail.
pub fn decode_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(COMPACT_PEER_SIZE)
        .filter_map(decode_peer)
        .collect()
}

pub fn encode_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(COMPACT_NODE_SIZE * nodes.len());

    for node in nodes {
        vec.extend_from_slice(node.id.as_bytes());
        vec.extend_from_slice(&encode_peer(&node.address));
    }

    vec
}

/// Decode concatenated compact nodes, ignoring a truncated tail.
pub fn decode_nodes(bytes: &[u8]) -> Vec<Node> {
    bytes
        .chunks_exact(COMPACT_NODE_SIZE)
        .filter_map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE]).ok()?;
            let address = decode_peer(&chunk[ID_SIZE..])?;

            Some(Node::new(id, address))
        })
        .collect()
}
