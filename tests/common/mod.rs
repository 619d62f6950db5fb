//! In-memory transport and message helpers shared by the integration tests.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddrV4;

use kadnode::{
    messages::{Message, MessageType, RequestSpecific, RequestTypeSpecific, ResponseSpecific},
    rpc::{Config, Rpc, Transport},
    Id,
};

/// Records every datagram instead of sending it.
#[derive(Debug)]
pub struct Recorder {
    local_addr: SocketAddrV4,
    pub sent: Vec<(SocketAddrV4, Message)>,
}

impl Recorder {
    pub fn new(port: u16) -> Self {
        Recorder {
            local_addr: address(port),
            sent: vec![],
        }
    }

    /// Drain the recorded datagrams.
    pub fn take(&mut self) -> Vec<(SocketAddrV4, Message)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for Recorder {
    fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<usize> {
        let message = Message::from_bytes(bytes)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        self.sent.push((address, message));

        Ok(bytes.len())
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

pub fn address(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new([127, 0, 0, 1].into(), port)
}

pub fn rpc(id: Id, seed: u64) -> Rpc<Recorder> {
    Rpc::new(
        id,
        Recorder::new(6881),
        Config {
            seed: Some(seed),
            ..Default::default()
        },
    )
}

pub fn query(transaction_id: &[u8], requester_id: Id, request_type: RequestTypeSpecific) -> Vec<u8> {
    Message {
        transaction_id: transaction_id.to_vec(),
        version: None,
        message_type: MessageType::Request(RequestSpecific {
            requester_id,
            request_type,
        }),
    }
    .to_bytes()
    .unwrap()
}

pub fn reply(transaction_id: &[u8], response: ResponseSpecific) -> Vec<u8> {
    Message {
        transaction_id: transaction_id.to_vec(),
        version: None,
        message_type: MessageType::Response(response),
    }
    .to_bytes()
    .unwrap()
}

/// Make `rpc` learn about a node by receiving a ping from it, discarding the pong.
pub fn introduce(rpc: &mut Rpc<Recorder>, id: Id, from: SocketAddrV4) {
    rpc.handle_message(from, &query(b"pi", id, RequestTypeSpecific::Ping));
    rpc.transport_mut().take();
}

/// The reply we got for a query, expects exactly one datagram sent.
pub fn single_reply(rpc: &mut Rpc<Recorder>) -> (SocketAddrV4, Message) {
    let mut sent = rpc.transport_mut().take();
    assert_eq!(sent.len(), 1, "expected a single datagram, got {:?}", sent);
    sent.remove(0)
}
