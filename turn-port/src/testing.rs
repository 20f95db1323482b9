// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fake sockets and a minimal TURN server for driving a [`TurnPort`] in tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::rc::Rc;
use std::time::Instant;

use rand::Rng;
use stun_proto::types::attribute::{ErrorCode, MessageIntegrity, Nonce, Realm, XorMappedAddress};
use stun_proto::types::message::{
    IntegrityAlgorithm, LongTermCredentials, Message, MessageClass, MessageHeader,
    MessageIntegrityCredentials, MessageType, MessageWriteVec, Method, TransactionId,
};
use stun_proto::types::prelude::*;
use tracing::trace;
use turn_types::attribute::{
    ChannelNumber, Data as AData, Lifetime, XorPeerAddress, XorRelayedAddress,
};
use turn_types::channel::ChannelData;
use turn_types::message::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH, SEND};
use turn_types::TurnCredentials;

use crate::config::TurnPortBuilder;
use crate::port::{TurnPort, TurnPortEvent, TurnPortRecv};
use crate::socket::{
    AsyncResolver, PacketOptions, PacketSocket, PacketSocketFactory, SocketOption,
    SocketOptions, TcpSocketOptions,
};
use crate::ProtocolAddress;

pub(crate) const TURN_USERNAME: &str = "turnuser";
pub(crate) const TURN_PASSWORD: &str = "turnpass";
const REALM: &str = "realm";
const CLIENT_PORT: u16 = 40000;

pub(crate) fn server_addr() -> SocketAddr {
    "127.0.0.1:3478".parse().unwrap()
}

pub(crate) fn client_ip() -> IpAddr {
    "192.168.1.2".parse().unwrap()
}

pub(crate) fn relayed_addr() -> SocketAddr {
    "10.0.0.20:2000".parse().unwrap()
}

#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub(crate) data: Vec<u8>,
    pub(crate) to: SocketAddr,
    pub(crate) options: PacketOptions,
}

#[derive(Debug, Default)]
pub(crate) struct SocketLog {
    pub(crate) sent: Vec<SentPacket>,
    pub(crate) options: HashMap<SocketOption, i32>,
    pub(crate) created_options: Option<SocketOptions>,
    pub(crate) tcp_options: Option<TcpSocketOptions>,
    pub(crate) fail_create: bool,
    pub(crate) fail_send: Option<io::ErrorKind>,
}

pub(crate) type SharedLog = Rc<RefCell<SocketLog>>;

#[derive(Debug)]
struct FakeSocket {
    log: SharedLog,
    local_addr: SocketAddr,
}

impl PacketSocket for FakeSocket {
    fn send(&mut self, data: &[u8], to: SocketAddr, options: &PacketOptions) -> io::Result<usize> {
        let mut log = self.log.borrow_mut();
        if let Some(kind) = log.fail_send {
            return Err(kind.into());
        }
        log.sent.push(SentPacket {
            data: data.to_vec(),
            to,
            options: *options,
        });
        Ok(data.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn set_option(&mut self, option: SocketOption, value: i32) -> io::Result<()> {
        self.log.borrow_mut().options.insert(option, value);
        Ok(())
    }

    fn get_option(&self, option: SocketOption) -> io::Result<i32> {
        self.log
            .borrow()
            .options
            .get(&option)
            .copied()
            .ok_or_else(|| io::ErrorKind::InvalidInput.into())
    }
}

#[derive(Debug)]
pub(crate) struct FakeSocketFactory {
    log: SharedLog,
}

impl FakeSocketFactory {
    pub(crate) fn new() -> (Self, SharedLog) {
        let log = SharedLog::default();
        (Self { log: log.clone() }, log)
    }

    fn create(
        &mut self,
        local_ip: IpAddr,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn PacketSocket>> {
        let mut log = self.log.borrow_mut();
        if log.fail_create {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        log.created_options = Some(options.clone());
        log.options.extend(options.iter());
        Ok(Box::new(FakeSocket {
            log: self.log.clone(),
            local_addr: SocketAddr::new(local_ip, CLIENT_PORT),
        }))
    }
}

impl PacketSocketFactory for FakeSocketFactory {
    fn create_udp_socket(
        &mut self,
        local_ip: IpAddr,
        _ports: RangeInclusive<u16>,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn PacketSocket>> {
        self.create(local_ip, options)
    }

    fn create_client_tcp_socket(
        &mut self,
        local_ip: IpAddr,
        _remote: SocketAddr,
        tcp: &TcpSocketOptions,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn PacketSocket>> {
        self.log.borrow_mut().tcp_options = Some(tcp.clone());
        self.create(local_ip, options)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeResolver {
    pub(crate) queries: Rc<RefCell<Vec<(String, u16)>>>,
}

impl AsyncResolver for FakeResolver {
    fn resolve(&mut self, host: &str, port: u16) {
        self.queries.borrow_mut().push((host.to_owned(), port));
    }
}

fn generate_nonce() -> String {
    let mut rng = rand::rng();
    String::from_iter((0..16).map(|_| rng.sample(rand::distr::Alphanumeric) as char))
}

/// A TURN server holding a single allocation with long-term authentication.
#[derive(Debug)]
pub(crate) struct TestServer {
    pub(crate) addr: SocketAddr,
    credentials: LongTermCredentials,
    nonce: String,
    /// Lifetime granted to allocations and refreshes.
    pub(crate) lifetime: u32,
    /// Answer every authenticated request with a stale nonce error.
    pub(crate) always_stale: bool,
    /// Leave the nonce out of authentication challenges.
    pub(crate) omit_challenge_nonce: bool,
    /// Never answer requests.
    pub(crate) drop_requests: bool,
    pub(crate) reject_permissions: Option<u16>,
    pub(crate) reject_binds: Option<u16>,
    permissions: HashSet<IpAddr>,
    channels: HashMap<u16, SocketAddr>,
    /// Methods of every request received.
    pub(crate) methods: Vec<Method>,
    /// Data forwarded to peers through the relay.
    pub(crate) relayed_to_peers: Vec<(SocketAddr, Vec<u8>)>,
    pub(crate) released: bool,
}

impl TestServer {
    pub(crate) fn new() -> Self {
        Self {
            addr: server_addr(),
            credentials: TurnCredentials::new(TURN_USERNAME, TURN_PASSWORD)
                .into_long_term_credentials(REALM),
            nonce: generate_nonce(),
            lifetime: 600,
            always_stale: false,
            omit_challenge_nonce: false,
            drop_requests: false,
            reject_permissions: None,
            reject_binds: None,
            permissions: HashSet::new(),
            channels: HashMap::new(),
            methods: vec![],
            relayed_to_peers: vec![],
            released: false,
        }
    }

    pub(crate) fn rotate_nonce(&mut self) {
        self.nonce = generate_nonce();
    }

    pub(crate) fn count(&self, method: Method) -> usize {
        self.methods.iter().filter(|m| **m == method).count()
    }

    fn challenge(&self, msg: &Message<'_>, code: u16) -> Vec<u8> {
        let mut builder = Message::builder_error(msg, MessageWriteVec::new());
        let error = ErrorCode::builder(code).build().unwrap();
        builder.add_attribute(&error).unwrap();
        let realm = Realm::new(REALM).unwrap();
        builder.add_attribute(&realm).unwrap();
        if !self.omit_challenge_nonce {
            let nonce = Nonce::new(&self.nonce).unwrap();
            builder.add_attribute(&nonce).unwrap();
        }
        builder.finish()
    }

    fn validate(&mut self, msg: &Message<'_>) -> Result<(), Vec<u8>> {
        if !msg.has_attribute(MessageIntegrity::TYPE) {
            trace!("no message-integrity, returning unauthorized");
            return Err(self.challenge(msg, ErrorCode::UNAUTHORIZED));
        }
        let nonce_matches = msg
            .attribute::<Nonce>()
            .is_ok_and(|nonce| nonce.nonce() == self.nonce);
        if self.always_stale || !nonce_matches {
            self.rotate_nonce();
            return Err(self.challenge(msg, ErrorCode::STALE_NONCE));
        }
        if msg
            .validate_integrity(&MessageIntegrityCredentials::LongTerm(
                self.credentials.clone(),
            ))
            .is_err()
        {
            return Err(self.challenge(msg, ErrorCode::UNAUTHORIZED));
        }
        Ok(())
    }

    fn finish_authed(&self, mut builder: MessageWriteVec) -> Vec<u8> {
        builder
            .add_message_integrity(
                &MessageIntegrityCredentials::LongTerm(self.credentials.clone()),
                IntegrityAlgorithm::Sha1,
            )
            .unwrap();
        builder.finish()
    }

    fn error(&self, msg: &Message<'_>, code: u16) -> Vec<u8> {
        let mut builder = Message::builder_error(msg, MessageWriteVec::new());
        let error = ErrorCode::builder(code).build().unwrap();
        builder.add_attribute(&error).unwrap();
        self.finish_authed(builder)
    }

    /// Handle a packet from the client at `from`, returning the response to send back.
    pub(crate) fn handle(&mut self, data: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        // STUN messages never start with a valid channel number
        if let Ok(channel) = ChannelData::parse(data) {
            let peer = *self.channels.get(&channel.id())?;
            self.relayed_to_peers.push((peer, channel.data().to_vec()));
            return None;
        }

        let msg = Message::from_bytes(data).ok()?;
        if msg.has_class(MessageClass::Indication) && msg.has_method(SEND) {
            let peer = msg
                .attribute::<XorPeerAddress>()
                .ok()?
                .addr(msg.transaction_id());
            let payload = msg.attribute::<AData>().ok()?;
            if self.permissions.contains(&peer.ip()) {
                self.relayed_to_peers.push((peer, payload.data().to_vec()));
            }
            return None;
        }
        if !msg.has_class(MessageClass::Request) || self.drop_requests {
            return None;
        }

        self.methods.push(msg.method());
        if let Err(response) = self.validate(&msg) {
            return Some(response);
        }

        let transaction = msg.transaction_id();
        let response = match msg.method() {
            ALLOCATE => {
                let mut builder = Message::builder_success(&msg, MessageWriteVec::new());
                let relayed = XorRelayedAddress::new(relayed_addr(), transaction);
                builder.add_attribute(&relayed).unwrap();
                let mapped = XorMappedAddress::new(from, transaction);
                builder.add_attribute(&mapped).unwrap();
                let lifetime = Lifetime::new(self.lifetime);
                builder.add_attribute(&lifetime).unwrap();
                self.finish_authed(builder)
            }
            REFRESH => {
                let requested = msg
                    .attribute::<Lifetime>()
                    .map(|lifetime| lifetime.seconds())
                    .unwrap_or(self.lifetime);
                if requested == 0 {
                    self.released = true;
                    self.permissions.clear();
                    self.channels.clear();
                }
                let mut builder = Message::builder_success(&msg, MessageWriteVec::new());
                let lifetime = Lifetime::new(requested);
                builder.add_attribute(&lifetime).unwrap();
                self.finish_authed(builder)
            }
            CREATE_PERMISSION => {
                if let Some(code) = self.reject_permissions {
                    return Some(self.error(&msg, code));
                }
                let peer = msg.attribute::<XorPeerAddress>().ok()?.addr(transaction);
                self.permissions.insert(peer.ip());
                self.finish_authed(Message::builder_success(&msg, MessageWriteVec::new()))
            }
            CHANNEL_BIND => {
                if let Some(code) = self.reject_binds {
                    return Some(self.error(&msg, code));
                }
                let peer = msg.attribute::<XorPeerAddress>().ok()?.addr(transaction);
                let channel = msg.attribute::<ChannelNumber>().ok()?.channel();
                self.permissions.insert(peer.ip());
                self.channels.insert(channel, peer);
                self.finish_authed(Message::builder_success(&msg, MessageWriteVec::new()))
            }
            _ => self.error(&msg, ErrorCode::BAD_REQUEST),
        };
        Some(response)
    }

    /// A Data indication carrying `data` from `peer`, regardless of permissions.
    pub(crate) fn data_indication(&self, peer: SocketAddr, data: &[u8]) -> Vec<u8> {
        let transaction = TransactionId::generate();
        let xor_peer_address = XorPeerAddress::new(peer, transaction);
        let payload = AData::new(data);
        let mut msg = Message::builder(
            MessageType::from_class_method(MessageClass::Indication, DATA),
            transaction,
            MessageWriteVec::with_capacity(
                MessageHeader::LENGTH + xor_peer_address.padded_len() + payload.padded_len(),
            ),
        );
        msg.add_attribute(&xor_peer_address).unwrap();
        msg.add_attribute(&payload).unwrap();
        msg.finish()
    }

    /// Relay `data` from `peer` to the client the way the server would.
    pub(crate) fn peer_send(&self, peer: SocketAddr, data: &[u8]) -> Option<Vec<u8>> {
        if let Some((channel, _peer)) = self.channels.iter().find(|(_id, bound)| **bound == peer) {
            let mut out = vec![0; 4 + data.len()];
            ChannelData::new(*channel, data).write_into_unchecked(&mut out);
            return Some(out);
        }
        if self.permissions.contains(&peer.ip()) {
            return Some(self.data_indication(peer, data));
        }
        None
    }
}

/// A [`TurnPort`] wired to a [`TestServer`] through fake sockets.
#[derive(Debug)]
pub(crate) struct TurnPortTest {
    pub(crate) port: TurnPort,
    pub(crate) server: TestServer,
    pub(crate) log: SharedLog,
    delivered: usize,
}

impl TurnPortTest {
    pub(crate) fn builder() -> TurnPortBuilder {
        Self::builder_with_password(TURN_PASSWORD)
    }

    pub(crate) fn builder_with_password(password: &str) -> TurnPortBuilder {
        TurnPort::builder(
            ProtocolAddress::udp(server_addr()),
            TurnCredentials::new(TURN_USERNAME, password),
        )
        .local_ip(client_ip())
    }

    pub(crate) fn new() -> Self {
        Self::from_builder(Self::builder())
    }

    pub(crate) fn from_builder(builder: TurnPortBuilder) -> Self {
        let (factory, log) = FakeSocketFactory::new();
        Self {
            port: builder.build(Box::new(factory)),
            server: TestServer::new(),
            log,
            delivered: 0,
        }
    }

    /// Deliver everything the port has sent to the server and feed the responses back until
    /// nothing more is sent.
    pub(crate) fn pump(&mut self, now: Instant) {
        loop {
            let pending = self.log.borrow().sent[self.delivered..].to_vec();
            if pending.is_empty() {
                return;
            }
            self.delivered += pending.len();
            let client = self.port.local_addr().unwrap();
            for packet in pending {
                assert_eq!(packet.to, self.server.addr);
                if let Some(response) = self.server.handle(&packet.data, client) {
                    let ret = self.port.on_read_packet(&response, self.server.addr, now);
                    trace!("response handled with {ret:?}");
                }
            }
        }
    }

    /// Drop everything the port has sent so far.
    pub(crate) fn discard_sent(&mut self) {
        self.delivered = self.log.borrow().sent.len();
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.log.borrow().sent.len()
    }

    pub(crate) fn allocate(&mut self, now: Instant) {
        self.port.prepare_address(now);
        self.pump(now);
        assert!(self.port.connected());
    }

    pub(crate) fn events(&mut self) -> Vec<TurnPortEvent> {
        std::iter::from_fn(|| self.port.poll_event()).collect()
    }

    /// Feed a packet relayed from `peer` into the port.
    pub(crate) fn receive_from_peer<'a>(
        &mut self,
        packet: &'a [u8],
        now: Instant,
    ) -> TurnPortRecv<'a> {
        self.port.on_read_packet(packet, self.server.addr, now)
    }
}
