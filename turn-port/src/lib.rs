// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # turn-port
//!
//! The client side of a TURN (RFC 5766) relay, presented in the shape of an ICE port.
//!
//! A [`TurnPort`] allocates a relayed transport address on a TURN server, keeps the allocation
//! alive, installs permissions and channel bindings for the peers it is asked to talk to, and
//! frames application data through the relay.
//!
//! The port does not perform any I/O itself. Sockets are created through a
//! [`PacketSocketFactory`] and the owner of the port is responsible for feeding received
//! packets and socket notifications back into the port. Time is provided by the caller through
//! [`TurnPort::poll`].
//!
//! ```
//! # use std::net::SocketAddr;
//! # use std::time::Instant;
//! use turn_port::{ProtocolAddress, TurnPort, TurnPortState};
//! use turn_port::types::TurnCredentials;
//! # #[derive(Debug)]
//! # struct NoSockets;
//! # impl turn_port::PacketSocketFactory for NoSockets {
//! #     fn create_udp_socket(
//! #         &mut self,
//! #         _local_ip: std::net::IpAddr,
//! #         _ports: std::ops::RangeInclusive<u16>,
//! #         _options: &turn_port::SocketOptions,
//! #     ) -> std::io::Result<Box<dyn turn_port::PacketSocket>> {
//! #         Err(std::io::ErrorKind::Unsupported.into())
//! #     }
//! #     fn create_client_tcp_socket(
//! #         &mut self,
//! #         _local_ip: std::net::IpAddr,
//! #         _remote: SocketAddr,
//! #         _tcp: &turn_port::TcpSocketOptions,
//! #         _options: &turn_port::SocketOptions,
//! #     ) -> std::io::Result<Box<dyn turn_port::PacketSocket>> {
//! #         Err(std::io::ErrorKind::Unsupported.into())
//! #     }
//! # }
//! let server: SocketAddr = "127.0.0.1:3478".parse().unwrap();
//! let credentials = TurnCredentials::new("user", "pass");
//! let mut port = TurnPort::builder(ProtocolAddress::udp(server), credentials)
//!     .local_ip("127.0.0.1".parse().unwrap())
//!     .build(Box::new(NoSockets));
//! assert_eq!(port.state(), TurnPortState::Init);
//! port.prepare_address(Instant::now());
//! // socket creation failed, which is reported as an event rather than a return value
//! assert!(matches!(port.poll_event(), Some(turn_port::TurnPortEvent::Error(_))));
//! ```

#![deny(missing_debug_implementations)]

pub use stun_proto as stun;
pub use turn_types as types;

mod address;
mod config;
mod entry;
mod error;
mod framing;
mod port;
mod request;
mod socket;

#[cfg(test)]
mod testing;

pub use address::{
    Candidate, CandidateKind, CandidateOrigin, ProtocolAddress, ProtocolType, ServerAddress,
    TURNS_DEFAULT_PORT, TURN_DEFAULT_PORT,
};
pub use config::{TurnPortBuilder, TurnPortConfig};
pub use entry::{BindState, PermissionState};
pub use error::{AllocateError, CreateConnectionError, ReleaseError, RequestError, SendError};
pub use framing::{TURN_CHANNEL_NUMBER_END, TURN_CHANNEL_NUMBER_START};
pub use port::{
    ConnectionId, ProxyConnection, TurnPort, TurnPortEvent, TurnPortPollRet, TurnPortRecv,
    TurnPortState,
};
pub use socket::{
    AsyncResolver, PacketOptions, PacketSocket, PacketSocketFactory, SocketOption,
    SocketOptions, TcpSocketOptions,
};
