// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # TURN port
//!
//! Owns the allocation on the TURN server, the socket towards it and the table of peers.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun_proto::agent::{HandleStunReply, StunAgent, StunAgentPollRet};
use stun_proto::types::attribute::{ErrorCode, Nonce, Realm};
use stun_proto::types::data::Data;
use stun_proto::types::message::{Message, MessageClass, MessageIntegrityCredentials, TransactionId};
use tracing::{debug, error, info, trace, warn};
use turn_types::attribute::{Data as AData, XorPeerAddress};
use turn_types::message::DATA;
use turn_types::TurnCredentials;

use crate::address::{
    is_compatible_address, Candidate, CandidateKind, CandidateOrigin, ProtocolAddress,
    ProtocolType, ServerAddress,
};
use crate::config::{TurnPortBuilder, TurnPortConfig};
use crate::entry::{BindState, EntryId, EntryTimer, PermissionState, TurnEntry};
use crate::error::{AllocateError, CreateConnectionError, ReleaseError, SendError};
use crate::framing::{self, CHANNEL_HEADER_LEN, TURN_CHANNEL_NUMBER_END, TURN_CHANNEL_NUMBER_START};
use crate::request::{
    AllocateRequest, AuthContext, ChannelBindRequest, CreatePermissionRequest, RefreshRequest,
    TurnRequest,
};
use crate::socket::{AsyncResolver, PacketOptions, PacketSocket, PacketSocketFactory, SocketOption};

/// Buffer before the allocation expires in which it is refreshed.
static REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Granted lifetimes below this are not refreshed.
const MIN_REFRESH_LIFETIME_SECS: u32 = 120;
/// How long to wait when nothing is scheduled.
static IDLE_WAIT: Duration = Duration::from_secs(9999);

/// Identifies a connection created through [`TurnPort::create_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection#{}", self.0)
    }
}

/// A connection to a peer through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConnection {
    id: ConnectionId,
    remote: Candidate,
    origin: CandidateOrigin,
}

impl ProxyConnection {
    /// The identifier of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote candidate this connection sends to.
    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote
    }

    /// Where the remote candidate was learnt from.
    pub fn origin(&self) -> CandidateOrigin {
        self.origin
    }
}

/// The lifecycle of the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPortState {
    /// [`TurnPort::prepare_address`] has not been called.
    Init,
    /// Waiting for the server host name to resolve.
    Resolving,
    /// Waiting for the TCP or TLS connection to the server.
    Connecting,
    /// Waiting for the allocation to be created.
    Allocating,
    /// The allocation exists and is kept alive.
    Allocated,
    /// The allocation is being released.
    Releasing,
    /// The allocation has been released.
    Released,
    /// The allocation failed.
    Error,
}

/// Events produced by a [`TurnPort`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPortEvent {
    /// The relayed address is ready.
    AddressReady(Candidate),
    /// The allocation failed. Produced at most once.
    Error(AllocateError),
    /// A permission request for a peer completed. `code` is `0` on success and the STUN error
    /// code otherwise.
    CreatePermissionResult {
        /// The peer address.
        peer: SocketAddr,
        /// The result.
        code: u16,
    },
    /// The socket can accept data again.
    ReadyToSend,
    /// The allocation has been released.
    Released,
}

/// Return value from [`TurnPort::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPortPollRet {
    /// Call [`TurnPort::poll`] again at the provided time.
    WaitUntil(Instant),
    /// The allocation is gone and no further progress will be made.
    Closed,
}

/// Return value from [`TurnPort::on_read_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPortRecv<'a> {
    /// The packet was consumed by the port.
    Handled,
    /// The packet was dropped.
    Ignored,
    /// Data from a peer with a connection.
    ConnectionData {
        /// The connection the data belongs to.
        connection: ConnectionId,
        /// The peer that sent the data.
        peer: SocketAddr,
        /// The data.
        data: &'a [u8],
    },
    /// Data from a peer without a connection.
    UnknownAddress {
        /// The peer that sent the data.
        peer: SocketAddr,
        /// The data.
        data: &'a [u8],
    },
}

/// The client side of a TURN allocation.
#[derive(Debug)]
pub struct TurnPort {
    server: ProtocolAddress,
    credentials: TurnCredentials,
    config: TurnPortConfig,
    factory: Box<dyn PacketSocketFactory>,
    resolver: Option<Box<dyn AsyncResolver>>,
    socket: Option<Box<dyn PacketSocket>>,
    stun_agent: Option<StunAgent>,
    state: TurnPortState,
    auth: Option<AuthContext>,
    relayed_address: Option<SocketAddr>,
    mapped_address: Option<SocketAddr>,
    error: Option<io::ErrorKind>,
    dscp: Option<u8>,

    entries: HashMap<SocketAddr, TurnEntry>,
    channels: HashMap<u16, SocketAddr>,
    next_channel_number: u16,
    next_entry_id: u64,
    next_connection_id: u64,

    outstanding: Vec<(TransactionId, TurnRequest)>,
    delayed: Vec<(Instant, TurnRequest)>,
    pending_events: VecDeque<TurnPortEvent>,
}

impl TurnPort {
    /// Start building a [`TurnPort`] towards `server` using `credentials`.
    pub fn builder(server: ProtocolAddress, credentials: TurnCredentials) -> TurnPortBuilder {
        TurnPortBuilder::new(server, credentials)
    }

    pub(crate) fn new(
        server: ProtocolAddress,
        credentials: TurnCredentials,
        config: TurnPortConfig,
        factory: Box<dyn PacketSocketFactory>,
        resolver: Option<Box<dyn AsyncResolver>>,
    ) -> Self {
        turn_types::debug_init();
        Self {
            server,
            credentials,
            config,
            factory,
            resolver,
            socket: None,
            stun_agent: None,
            state: TurnPortState::Init,
            auth: None,
            relayed_address: None,
            mapped_address: None,
            error: None,
            dscp: None,
            entries: HashMap::new(),
            channels: HashMap::new(),
            next_channel_number: TURN_CHANNEL_NUMBER_START,
            next_entry_id: 0,
            next_connection_id: 0,
            outstanding: vec![],
            delayed: vec![],
            pending_events: VecDeque::new(),
        }
    }

    /// The TURN server this port allocates on.
    pub fn server_address(&self) -> &ProtocolAddress {
        &self.server
    }

    /// The configuration of this port.
    pub fn config(&self) -> &TurnPortConfig {
        &self.config
    }

    /// The state of the allocation.
    pub fn state(&self) -> TurnPortState {
        self.state
    }

    /// Whether the allocation exists and data can be sent.
    pub fn connected(&self) -> bool {
        self.state == TurnPortState::Allocated
    }

    /// The local address of the socket towards the server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|socket| socket.local_addr())
    }

    /// The relayed address allocated on the server.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.relayed_address
    }

    /// Our address as seen by the server.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.mapped_address
    }

    /// The channel number assigned to `peer`.
    pub fn channel_for(&self, peer: SocketAddr) -> Option<u16> {
        self.entries.get(&peer).map(TurnEntry::channel_id)
    }

    /// The channel binding state of `peer`.
    pub fn bind_state(&self, peer: SocketAddr) -> Option<BindState> {
        self.entries.get(&peer).map(TurnEntry::state)
    }

    /// The permission state of `peer`.
    pub fn permission_state(&self, peer: SocketAddr) -> Option<PermissionState> {
        self.entries.get(&peer).map(TurnEntry::permission)
    }

    /// The last error produced by the socket.
    pub fn error(&self) -> Option<io::ErrorKind> {
        self.error
    }

    /// Start allocating a relayed address.
    ///
    /// The outcome is reported through [`TurnPortEvent::AddressReady`] or
    /// [`TurnPortEvent::Error`].
    #[tracing::instrument(
        name = "turn_port_prepare_address",
        skip(self, now),
        fields(server = %self.server.address, protocol = %self.server.protocol)
    )]
    pub fn prepare_address(&mut self, now: Instant) {
        if self.state != TurnPortState::Init {
            warn!(state = ?self.state, "Address preparation already started");
            return;
        }
        if self.credentials.username().is_empty() || self.credentials.password().is_empty() {
            error!("Allocation requires both a username and a password");
            self.on_allocate_error(AllocateError::MissingCredentials);
            return;
        }
        self.server.apply_default_port();

        match self.server.address.clone() {
            ServerAddress::Resolved(server) => self.create_socket(server, now),
            ServerAddress::Hostname { host, port } => {
                let Some(resolver) = self.resolver.as_mut() else {
                    error!(%host, "No resolver available for the server host name");
                    self.on_allocate_error(AllocateError::ResolveFailed(host));
                    return;
                };
                info!(%host, port, "Resolving server address");
                self.state = TurnPortState::Resolving;
                resolver.resolve(&host, port);
            }
        }
    }

    /// Complete a resolution started through [`AsyncResolver::resolve`].
    #[tracing::instrument(name = "turn_port_resolve_result", skip(self, now))]
    pub fn on_resolve_result(&mut self, result: io::Result<SocketAddr>, now: Instant) {
        if self.state != TurnPortState::Resolving {
            warn!(state = ?self.state, "Unexpected resolve result");
            return;
        }
        match result {
            Ok(resolved) => {
                let server = SocketAddr::new(resolved.ip(), self.server.address.port());
                info!(%server, "Resolved server address");
                self.server.address = ServerAddress::Resolved(server);
                self.create_socket(server, now);
            }
            Err(err) => {
                error!("Failed to resolve {}: {err}", self.server.address);
                let server = self.server.address.to_string();
                self.on_allocate_error(AllocateError::ResolveFailed(server));
            }
        }
    }

    fn create_socket(&mut self, server: SocketAddr, now: Instant) {
        if !is_compatible_address(self.config.local_ip, server.ip()) {
            error!(
                %server,
                local_ip = %self.config.local_ip,
                "Server address family does not match"
            );
            self.on_allocate_error(AllocateError::IncompatibleAddress(server));
            return;
        }

        let socket = match self.server.protocol {
            ProtocolType::Udp => self.factory.create_udp_socket(
                self.config.local_ip,
                self.config.port_range.clone(),
                &self.config.socket_options,
            ),
            ProtocolType::Tcp => {
                let mut tcp = self.config.tcp_options.clone();
                tcp.stun_framing = true;
                tcp.tls = self.server.secure;
                self.factory.create_client_tcp_socket(
                    self.config.local_ip,
                    server,
                    &tcp,
                    &self.config.socket_options,
                )
            }
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(err) => {
                error!("Failed to create socket: {err}");
                self.on_allocate_error(AllocateError::SocketCreation(err.kind()));
                return;
            }
        };

        let stun_agent = StunAgent::builder(self.server.protocol.transport(), socket.local_addr())
            .remote_addr(server)
            .build();
        debug!(local_addr = %socket.local_addr(), %server, "Created socket");
        self.socket = Some(socket);
        self.stun_agent = Some(stun_agent);

        match self.server.protocol {
            ProtocolType::Udp => self.send_allocate(now),
            ProtocolType::Tcp => self.state = TurnPortState::Connecting,
        }
    }

    fn send_allocate(&mut self, now: Instant) {
        self.state = TurnPortState::Allocating;
        self.send_request(AllocateRequest::default(), Duration::ZERO, now);
    }

    /// The TCP or TLS connection to the server has been established.
    #[tracing::instrument(name = "turn_port_socket_connect", skip(self, now))]
    pub fn on_socket_connect(&mut self, now: Instant) {
        if self.state != TurnPortState::Connecting {
            warn!(state = ?self.state, "Unexpected socket connection");
            return;
        }
        info!("Connected to the TURN server");
        self.send_allocate(now);
    }

    /// The connection to the server closed.
    #[tracing::instrument(name = "turn_port_socket_close", skip(self))]
    pub fn on_socket_close(&mut self, error: Option<io::ErrorKind>) {
        warn!(?error, "Connection to the TURN server closed");
        if let Some(error) = error {
            self.error = Some(error);
        }
        if matches!(
            self.state,
            TurnPortState::Connecting | TurnPortState::Allocating
        ) {
            self.on_allocate_error(AllocateError::SocketClosed);
        }
    }

    /// The socket can accept data again after a send failed.
    pub fn on_ready_to_send(&mut self) {
        if self.connected() {
            self.pending_events.push_back(TurnPortEvent::ReadyToSend);
        }
    }

    /// Create a connection to `candidate` through the relay.
    ///
    /// The first connection for a peer address creates its entry and requests a permission,
    /// immediately when allocated and otherwise once the allocation succeeds. Further
    /// connections to the same address share that entry.
    #[tracing::instrument(
        name = "turn_port_create_connection",
        skip(self, candidate, now),
        fields(peer = %candidate.address),
        err
    )]
    pub fn create_connection(
        &mut self,
        candidate: &Candidate,
        origin: CandidateOrigin,
        now: Instant,
    ) -> Result<ProxyConnection, CreateConnectionError> {
        let peer = candidate.address;
        if candidate.protocol != ProtocolType::Udp {
            return Err(CreateConnectionError::UnsupportedProtocol(candidate.protocol));
        }
        if !is_compatible_address(self.config.local_ip, peer.ip()) {
            return Err(CreateConnectionError::IncompatibleAddress(peer));
        }
        if !self.entries.contains_key(&peer) && self.next_channel_number > TURN_CHANNEL_NUMBER_END {
            return Err(CreateConnectionError::ChannelsExhausted);
        }

        let connection = ConnectionId::new(self.next_connection_id);
        self.next_connection_id += 1;

        if let Some(entry) = self.entries.get_mut(&peer) {
            debug!(%peer, id = %entry.id(), %connection, "Reusing entry");
            entry.add_connection(connection);
        } else {
            let channel = self.next_channel_number;
            self.next_channel_number += 1;
            let id = EntryId::new(self.next_entry_id);
            self.next_entry_id += 1;

            debug!(%peer, channel, %id, "Creating entry");
            self.entries
                .insert(peer, TurnEntry::new(id, connection, channel, peer));
            self.channels.insert(channel, peer);
            if self.connected() {
                self.send_request(CreatePermissionRequest::new(id, peer), Duration::ZERO, now);
            } else {
                debug!(%peer, "Permission will be requested once allocated");
            }
        }

        Ok(ProxyConnection {
            id: connection,
            remote: candidate.clone(),
            origin,
        })
    }

    /// Destroy a connection and the peer state behind it, together with every other connection
    /// to the same peer address. Returns whether the connection existed.
    ///
    /// Answers to requests still outstanding for the peer are ignored.
    pub fn destroy_connection(&mut self, connection: ConnectionId) -> bool {
        let Some(peer) = self
            .entries
            .values()
            .find(|entry| entry.has_connection(connection))
            .map(TurnEntry::ext_addr)
        else {
            return false;
        };
        self.destroy_entry(peer);
        true
    }

    fn destroy_entry(&mut self, peer: SocketAddr) {
        if let Some(entry) = self.entries.remove(&peer) {
            debug!(%peer, id = %entry.id(), channel = entry.channel_id(), "Destroying entry");
            self.channels.remove(&entry.channel_id());
        }
    }

    /// Send `data` to `to` through the relay. Returns the number of bytes of `data` sent.
    ///
    /// `payload` marks application data, which moves the peer onto a channel binding.
    #[tracing::instrument(
        name = "turn_port_send_to",
        level = "trace",
        skip(self, data, options, now),
        fields(len = data.len())
    )]
    pub fn send_to(
        &mut self,
        data: &[u8],
        to: SocketAddr,
        options: PacketOptions,
        payload: bool,
        now: Instant,
    ) -> Result<usize, SendError> {
        if !self.connected() {
            self.error = Some(io::ErrorKind::WouldBlock);
            return Err(SendError::WouldBlock);
        }
        let Some(entry) = self.entries.get_mut(&to) else {
            warn!(peer = %to, "No connection for peer");
            return Err(SendError::NoEntry(to));
        };
        let frame = entry.send(data, payload, self.server.protocol)?;
        if frame.bind_channel {
            let request = ChannelBindRequest::new(entry.id(), to, entry.channel_id());
            debug!(peer = %to, channel = entry.channel_id(), "Binding channel");
            self.send_request(request, Duration::ZERO, now);
        }
        self.send_to_server(&frame.data, options)?;
        Ok(data.len())
    }

    fn send_to_server(&mut self, data: &[u8], options: PacketOptions) -> io::Result<usize> {
        let (Some(socket), Some(server)) = (self.socket.as_mut(), self.server.address.resolved())
        else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        match socket.send(data, server, &options) {
            Ok(sent) => Ok(sent),
            Err(err) => {
                warn!("Failed to send {} bytes to the server: {err}", data.len());
                self.error = Some(err.kind());
                Err(err)
            }
        }
    }

    /// Set an option on the socket. The DSCP value is kept by the port and applied to every
    /// packet. Options set before the socket exists are applied when it is created.
    pub fn set_option(&mut self, option: SocketOption, value: i32) -> io::Result<()> {
        if option == SocketOption::Dscp {
            self.dscp = match value {
                v if v < 0 => None,
                0..=63 => Some(value as u8),
                _ => return Err(io::ErrorKind::InvalidInput.into()),
            };
            return Ok(());
        }
        match self.socket.as_mut() {
            Some(socket) => socket.set_option(option, value),
            None => {
                self.config.socket_options.set(option, value);
                Ok(())
            }
        }
    }

    /// Retrieve the value of an option.
    pub fn get_option(&self, option: SocketOption) -> io::Result<i32> {
        if option == SocketOption::Dscp {
            return Ok(self.dscp.map_or(-1, i32::from));
        }
        match self.socket.as_ref() {
            Some(socket) => socket.get_option(option),
            None => self
                .config
                .socket_options
                .get(option)
                .ok_or_else(|| io::ErrorKind::NotConnected.into()),
        }
    }

    /// Release the allocation on the server. Completion is reported with
    /// [`TurnPortEvent::Released`].
    pub fn release(&mut self, now: Instant) -> Result<(), ReleaseError> {
        if self.state != TurnPortState::Allocated {
            return Err(ReleaseError::NoAllocation);
        }
        info!("Releasing allocation");
        self.delayed
            .retain(|(_at, request)| !matches!(request, TurnRequest::Refresh(_)));
        self.entries.clear();
        self.channels.clear();
        self.state = TurnPortState::Releasing;
        self.send_request(RefreshRequest::release(), Duration::ZERO, now);
        Ok(())
    }

    /// Handle a packet received on the socket towards the server.
    #[tracing::instrument(
        name = "turn_port_read_packet",
        level = "trace",
        skip(self, data, now),
        fields(len = data.len())
    )]
    pub fn on_read_packet<'a>(
        &mut self,
        data: &'a [u8],
        from: SocketAddr,
        now: Instant,
    ) -> TurnPortRecv<'a> {
        if self.server.address.resolved() != Some(from) {
            trace!("Packet is not from the TURN server");
            return TurnPortRecv::Ignored;
        }
        if self.state == TurnPortState::Error {
            return TurnPortRecv::Ignored;
        }
        if data.len() < CHANNEL_HEADER_LEN {
            warn!("Received a TURN message that was too short");
            return TurnPortRecv::Ignored;
        }

        if framing::is_channel_data(data) {
            return self.handle_channel_data(data);
        }

        let Ok(msg) = Message::from_bytes(data) else {
            trace!("Failed to parse STUN message");
            return TurnPortRecv::Ignored;
        };
        if msg.has_class(MessageClass::Indication) && msg.has_method(DATA) {
            return self.handle_data_indication(data, &msg);
        }
        if !msg.is_response() {
            trace!("Ignoring unexpected STUN message {msg}");
            return TurnPortRecv::Ignored;
        }
        self.handle_response(msg, from, now)
    }

    fn handle_channel_data<'a>(&self, data: &'a [u8]) -> TurnPortRecv<'a> {
        let Some((channel, payload)) = framing::parse_channel_data(data) else {
            warn!(len = data.len(), "Received truncated channel data");
            return TurnPortRecv::Ignored;
        };
        let Some(peer) = self.channels.get(&channel).copied() else {
            warn!(channel, "Received channel data for an unknown channel");
            return TurnPortRecv::Ignored;
        };
        self.dispatch(peer, payload)
    }

    fn handle_data_indication<'a>(&self, data: &'a [u8], msg: &Message<'_>) -> TurnPortRecv<'a> {
        let Ok(peer) = msg
            .attribute::<XorPeerAddress>()
            .map(|peer| peer.addr(msg.transaction_id()))
        else {
            warn!("Data indication is missing XOR-PEER-ADDRESS");
            return TurnPortRecv::Ignored;
        };
        let Ok((offset, payload)) = msg.attribute_and_offset::<AData>() else {
            warn!("Data indication is missing DATA");
            return TurnPortRecv::Ignored;
        };
        if !self.has_permission(peer.ip()) {
            warn!(%peer, "Received data indication from a peer without a permission");
            return TurnPortRecv::Ignored;
        }
        let start = offset + 4;
        self.dispatch(peer, &data[start..start + payload.data().len()])
    }

    fn has_permission(&self, ip: IpAddr) -> bool {
        self.entries.values().any(|entry| {
            entry.ext_addr().ip() == ip && entry.permission() == PermissionState::Granted
        })
    }

    fn dispatch<'a>(&self, peer: SocketAddr, data: &'a [u8]) -> TurnPortRecv<'a> {
        match self.entries.get(&peer) {
            Some(entry) => TurnPortRecv::ConnectionData {
                connection: entry.connection(),
                peer,
                data,
            },
            None => TurnPortRecv::UnknownAddress { peer, data },
        }
    }

    fn handle_response<'a>(
        &mut self,
        msg: Message<'_>,
        from: SocketAddr,
        now: Instant,
    ) -> TurnPortRecv<'a> {
        if msg.has_class(MessageClass::Success) {
            let valid = self.auth.as_ref().is_some_and(|auth| {
                msg.validate_integrity(&MessageIntegrityCredentials::LongTerm(
                    auth.credentials.clone(),
                ))
                .is_ok()
            });
            if !valid {
                warn!(
                    transaction = %msg.transaction_id(),
                    "Dropping success response that failed the integrity check"
                );
                return TurnPortRecv::Ignored;
            }
        }

        let Some(stun_agent) = self.stun_agent.as_mut() else {
            return TurnPortRecv::Ignored;
        };
        let msg = match stun_agent.handle_stun(msg, from) {
            HandleStunReply::Drop | HandleStunReply::IncomingStun(_) => {
                return TurnPortRecv::Ignored
            }
            HandleStunReply::ValidatedStunResponse(msg) => msg,
            HandleStunReply::UnvalidatedStunResponse(msg) => {
                stun_agent.remove_outstanding_request(msg.transaction_id());
                msg
            }
        };

        let transaction = msg.transaction_id();
        let Some(request) = self.take_outstanding(transaction) else {
            trace!(%transaction, "No request for the response");
            return TurnPortRecv::Ignored;
        };
        if msg.has_class(MessageClass::Error) {
            let Ok(code) = msg.attribute::<ErrorCode>().map(|err| err.code()) else {
                warn!(%transaction, "Error response is missing ERROR-CODE");
                return TurnPortRecv::Handled;
            };
            trace!(%transaction, code, method = ?request.method(), "Received error response");
            request.on_error_response(self, &msg, code, now);
        } else {
            trace!(%transaction, method = ?request.method(), "Received success response");
            request.on_response(self, &msg, now);
        }
        TurnPortRecv::Handled
    }

    fn take_outstanding(&mut self, transaction: TransactionId) -> Option<TurnRequest> {
        let idx = self
            .outstanding
            .iter()
            .position(|(outstanding, _request)| *outstanding == transaction)?;
        Some(self.outstanding.swap_remove(idx).1)
    }

    /// Send `request` after `delay`.
    pub(crate) fn send_request(
        &mut self,
        request: impl Into<TurnRequest>,
        delay: Duration,
        now: Instant,
    ) {
        let request = request.into();
        if delay.is_zero() {
            self.send_request_now(request, now);
        } else {
            trace!(?delay, method = ?request.method(), "Delaying request");
            self.delayed.push((now + delay, request));
        }
    }

    fn send_request_now(&mut self, request: TurnRequest, now: Instant) {
        if let Some(entry) = request.entry() {
            if !self.entries.values().any(|existing| existing.id() == entry) {
                trace!(%entry, "Entry was destroyed, not sending request");
                return;
            }
        }
        let prepared = match request.prepare(self.auth.as_ref(), self.config.software.as_deref())
        {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(method = ?request.method(), "Failed to write request: {err}");
                if matches!(request, TurnRequest::Allocate(_)) {
                    self.on_allocate_error(err.into());
                }
                return;
            }
        };
        let Some(stun_agent) = self.stun_agent.as_mut() else {
            warn!(method = ?request.method(), "No connection to the TURN server");
            return;
        };
        let Some(server) = stun_agent.remote_addr() else {
            return;
        };
        let transmit = match stun_agent.send_request(&prepared.data, server, now) {
            Ok(transmit) => transmit.into_owned(),
            Err(err) => {
                warn!(method = ?request.method(), "Failed to send request: {err:?}");
                return;
            }
        };
        trace!(
            method = ?request.method(),
            transaction = %prepared.transaction_id,
            "Sending request"
        );
        self.outstanding.push((prepared.transaction_id, request));
        let options = PacketOptions { dscp: self.dscp };
        if let Err(err) = self.send_to_server(&transmit.data, options) {
            debug!("Request will be retransmitted after failing to send: {err}");
        }
    }

    pub(crate) fn has_credentials(&self) -> bool {
        self.auth.is_some()
    }

    /// Take the realm and nonce from a challenge. Returns whether both were present.
    pub(crate) fn update_nonce(&mut self, msg: &Message<'_>) -> bool {
        let Ok(realm) = msg
            .attribute::<Realm>()
            .map(|realm| realm.realm().to_string())
        else {
            warn!("Response is missing REALM");
            return false;
        };
        let Ok(nonce) = msg
            .attribute::<Nonce>()
            .map(|nonce| nonce.nonce().to_string())
        else {
            warn!("Response is missing NONCE");
            return false;
        };

        let credentials = match self.auth.take() {
            Some(auth) if auth.credentials.realm() == realm => auth.credentials,
            _ => {
                debug!(%realm, "Using new realm");
                self.credentials.clone().into_long_term_credentials(&realm)
            }
        };
        if let Some(stun_agent) = self.stun_agent.as_mut() {
            stun_agent
                .set_remote_credentials(MessageIntegrityCredentials::LongTerm(credentials.clone()));
        }
        self.auth = Some(AuthContext { credentials, nonce });
        true
    }

    /// Record the allocation and request the permissions of peers added while allocating.
    /// Returns whether it was expected.
    pub(crate) fn on_allocate_success(
        &mut self,
        relayed: SocketAddr,
        mapped: SocketAddr,
        now: Instant,
    ) -> bool {
        if self.state != TurnPortState::Allocating {
            warn!(state = ?self.state, "Unexpected allocate success");
            return false;
        }
        info!(%relayed, %mapped, "Allocation created");
        self.relayed_address = Some(relayed);
        self.mapped_address = Some(mapped);
        self.state = TurnPortState::Allocated;
        let candidate = Candidate::new(CandidateKind::Relayed, ProtocolType::Udp, relayed)
            .with_related_address(mapped)
            .with_type_preference(self.server.relay_preference());
        self.pending_events
            .push_back(TurnPortEvent::AddressReady(candidate));

        let mut waiting = self
            .entries
            .values()
            .map(|entry| (entry.id(), entry.ext_addr()))
            .collect::<Vec<_>>();
        waiting.sort_unstable_by_key(|(id, _peer)| *id);
        for (id, peer) in waiting {
            debug!(%peer, %id, "Requesting held back permission");
            self.send_request(CreatePermissionRequest::new(id, peer), Duration::ZERO, now);
        }
        true
    }

    pub(crate) fn on_allocate_error(&mut self, error: AllocateError) {
        if self.state == TurnPortState::Error {
            return;
        }
        error!("Allocation failed: {error}");
        self.state = TurnPortState::Error;
        self.delayed.clear();
        self.pending_events.push_back(TurnPortEvent::Error(error));
    }

    /// Schedule a refresh before `lifetime` seconds elapse. Returns whether a refresh was
    /// scheduled.
    ///
    /// Lifetimes shorter than two minutes are not refreshed and the allocation lapses.
    pub(crate) fn schedule_refresh(&mut self, lifetime: u32, now: Instant) -> bool {
        if lifetime < MIN_REFRESH_LIFETIME_SECS {
            warn!(lifetime, "Allocation lifetime too short, not refreshing");
            return false;
        }
        let delay = Duration::from_secs(lifetime as u64) - REFRESH_MARGIN;
        debug!(lifetime, ?delay, "Scheduling refresh");
        self.send_request(RefreshRequest::default(), delay, now);
        true
    }

    pub(crate) fn on_release_complete(&mut self) {
        if self.state != TurnPortState::Releasing {
            return;
        }
        self.state = TurnPortState::Released;
        self.pending_events.push_back(TurnPortEvent::Released);
    }

    fn entry_mut(&mut self, id: EntryId, peer: SocketAddr) -> Option<&mut TurnEntry> {
        let entry = self
            .entries
            .get_mut(&peer)
            .filter(|entry| entry.id() == id);
        if entry.is_none() {
            trace!(%id, %peer, "Entry no longer exists");
        }
        entry
    }

    pub(crate) fn on_create_permission_success(
        &mut self,
        id: EntryId,
        peer: SocketAddr,
        now: Instant,
    ) {
        let Some(entry) = self.entry_mut(id, peer) else {
            return;
        };
        entry.on_create_permission_success(now);
        self.pending_events
            .push_back(TurnPortEvent::CreatePermissionResult { peer, code: 0 });
    }

    pub(crate) fn on_create_permission_error(&mut self, id: EntryId, peer: SocketAddr, code: u16) {
        let Some(entry) = self.entry_mut(id, peer) else {
            return;
        };
        entry.on_create_permission_error(code);
        self.pending_events
            .push_back(TurnPortEvent::CreatePermissionResult { peer, code });
    }

    pub(crate) fn on_channel_bind_success(&mut self, id: EntryId, peer: SocketAddr, now: Instant) {
        if let Some(entry) = self.entry_mut(id, peer) {
            entry.on_channel_bind_success(now);
        }
    }

    pub(crate) fn on_channel_bind_error(&mut self, id: EntryId, peer: SocketAddr, code: u16) {
        if let Some(entry) = self.entry_mut(id, peer) {
            entry.on_channel_bind_error(code);
        }
    }

    /// Advance timers: delayed requests, peer refreshes, retransmissions and timeouts.
    #[tracing::instrument(name = "turn_port_poll", level = "trace", ret, skip(self))]
    pub fn poll(&mut self, now: Instant) -> TurnPortPollRet {
        if matches!(self.state, TurnPortState::Error | TurnPortState::Released) {
            return TurnPortPollRet::Closed;
        }

        let (due, delayed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _request)| *at <= now);
        self.delayed = delayed;
        for (_at, request) in due {
            self.send_request_now(request, now);
        }

        let timers = self
            .entries
            .values_mut()
            .filter_map(|entry| {
                entry
                    .poll_timer(now)
                    .map(|timer| (entry.id(), entry.ext_addr(), entry.channel_id(), timer))
            })
            .collect::<Vec<_>>();
        for (id, peer, channel, timer) in timers {
            match timer {
                EntryTimer::Rebind => {
                    debug!(%peer, channel, "Refreshing channel binding");
                    let request = ChannelBindRequest::new(id, peer, channel);
                    self.send_request(request, Duration::ZERO, now);
                }
                EntryTimer::RefreshPermission => {
                    debug!(%peer, "Refreshing permission");
                    self.send_request(CreatePermissionRequest::new(id, peer), Duration::ZERO, now);
                }
            }
        }

        let mut earliest_wait = now + IDLE_WAIT;
        let cancelled_transaction = match self.stun_agent.as_mut().map(|agent| agent.poll(now)) {
            Some(StunAgentPollRet::WaitUntil(wait)) => {
                earliest_wait = earliest_wait.min(wait);
                None
            }
            Some(StunAgentPollRet::TransactionTimedOut(transaction))
            | Some(StunAgentPollRet::TransactionCancelled(transaction)) => Some(transaction),
            None => None,
        };
        if let Some(transaction) = cancelled_transaction {
            trace!(%transaction, "STUN transaction timed out or was cancelled");
            // more transactions may be waiting to be reported
            earliest_wait = now;
            if let Some(request) = self.take_outstanding(transaction) {
                request.on_timeout(self);
            }
        }

        loop {
            let Some(transmit) = self
                .stun_agent
                .as_mut()
                .and_then(|agent| agent.poll_transmit(now))
                .map(|transmit| transmit.reinterpret_data(|data| Data::from(data).into_owned()))
            else {
                break;
            };
            trace!("Retransmitting request");
            let options = PacketOptions { dscp: self.dscp };
            if let Err(err) = self.send_to_server(&transmit.data, options) {
                debug!("Failed to retransmit: {err}");
            }
        }

        if matches!(self.state, TurnPortState::Error | TurnPortState::Released) {
            return TurnPortPollRet::Closed;
        }
        if let Some(at) = self.delayed.iter().map(|(at, _request)| *at).min() {
            earliest_wait = earliest_wait.min(at);
        }
        if let Some(at) = self.entries.values().filter_map(TurnEntry::next_deadline).min() {
            earliest_wait = earliest_wait.min(at);
        }
        TurnPortPollRet::WaitUntil(earliest_wait.max(now))
    }

    /// Retrieve the next event.
    pub fn poll_event(&mut self) -> Option<TurnPortEvent> {
        self.pending_events.pop_front()
    }
}
