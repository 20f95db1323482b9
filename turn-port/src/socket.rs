// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The sockets and resolver a [`TurnPort`](crate::TurnPort) is driven with.
//!
//! Notifications from these objects (received packets, connection establishment, closure,
//! resolution results) are delivered by calling the matching method on the
//! [`TurnPort`](crate::TurnPort).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;

/// Options that can be set on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// The DiffServ code point of outgoing packets. Kept by the port and passed with every packet.
    Dscp,
    /// The size of the send buffer.
    SendBufferSize,
    /// The size of the receive buffer.
    RecvBufferSize,
    /// Disable Nagle's algorithm on TCP sockets.
    NoDelay,
    /// Set the don't fragment bit on outgoing packets.
    DontFragment,
}

/// Socket options to apply when a socket is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    send_buffer_size: Option<i32>,
    recv_buffer_size: Option<i32>,
    no_delay: Option<i32>,
    dont_fragment: Option<i32>,
}

impl SocketOptions {
    /// Store a value for `option`.
    pub fn set(&mut self, option: SocketOption, value: i32) {
        match option {
            // travels with every packet instead
            SocketOption::Dscp => (),
            SocketOption::SendBufferSize => self.send_buffer_size = Some(value),
            SocketOption::RecvBufferSize => self.recv_buffer_size = Some(value),
            SocketOption::NoDelay => self.no_delay = Some(value),
            SocketOption::DontFragment => self.dont_fragment = Some(value),
        }
    }

    /// The stored value for `option`.
    pub fn get(&self, option: SocketOption) -> Option<i32> {
        match option {
            SocketOption::Dscp => None,
            SocketOption::SendBufferSize => self.send_buffer_size,
            SocketOption::RecvBufferSize => self.recv_buffer_size,
            SocketOption::NoDelay => self.no_delay,
            SocketOption::DontFragment => self.dont_fragment,
        }
    }

    /// Iterate over all the options that have a value.
    pub fn iter(&self) -> impl Iterator<Item = (SocketOption, i32)> + '_ {
        [
            SocketOption::SendBufferSize,
            SocketOption::RecvBufferSize,
            SocketOption::NoDelay,
            SocketOption::DontFragment,
        ]
        .into_iter()
        .filter_map(|option| self.get(option).map(|value| (option, value)))
    }
}

/// How a client TCP socket towards a TURN server should be set up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpSocketOptions {
    /// Frame the byte stream as a sequence of STUN messages and ChannelData frames.
    pub stun_framing: bool,
    /// Wrap the connection in TLS.
    pub tls: bool,
    /// A proxy to connect through.
    pub proxy: Option<SocketAddr>,
    /// The user agent to present to the proxy.
    pub user_agent: Option<String>,
}

/// Options attached to an individual outgoing packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// The DiffServ code point, or `None` to leave the socket's value unchanged.
    pub dscp: Option<u8>,
}

/// A socket connected to, or able to send to, a TURN server.
pub trait PacketSocket: std::fmt::Debug {
    /// Send `data` to `to`. Returns the number of bytes sent.
    fn send(&mut self, data: &[u8], to: SocketAddr, options: &PacketOptions) -> io::Result<usize>;

    /// The local address of the socket.
    fn local_addr(&self) -> SocketAddr;

    /// Set an option on the socket.
    fn set_option(&mut self, option: SocketOption, value: i32) -> io::Result<()>;

    /// Retrieve the value of an option on the socket.
    fn get_option(&self, option: SocketOption) -> io::Result<i32>;
}

/// Creates sockets for a [`TurnPort`](crate::TurnPort).
pub trait PacketSocketFactory: std::fmt::Debug {
    /// Create a UDP socket bound to `local_ip` and a port within `ports`. A range of `0..=0`
    /// allows any port.
    fn create_udp_socket(
        &mut self,
        local_ip: IpAddr,
        ports: RangeInclusive<u16>,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn PacketSocket>>;

    /// Start connecting a TCP socket from `local_ip` to `remote`. Completion is reported through
    /// [`TurnPort::on_socket_connect`](crate::TurnPort::on_socket_connect) or
    /// [`TurnPort::on_socket_close`](crate::TurnPort::on_socket_close).
    fn create_client_tcp_socket(
        &mut self,
        local_ip: IpAddr,
        remote: SocketAddr,
        tcp: &TcpSocketOptions,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn PacketSocket>>;
}

/// Resolves DNS names asynchronously.
pub trait AsyncResolver: std::fmt::Debug {
    /// Start resolving `host`. The result is reported through
    /// [`TurnPort::on_resolve_result`](crate::TurnPort::on_resolve_result).
    fn resolve(&mut self, host: &str, port: u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_options_store_values() {
        let _log = crate::tests::test_init_log();
        let mut options = SocketOptions::default();
        assert_eq!(options.iter().count(), 0);
        options.set(SocketOption::SendBufferSize, 65536);
        options.set(SocketOption::NoDelay, 1);
        options.set(SocketOption::Dscp, 46);
        assert_eq!(options.get(SocketOption::SendBufferSize), Some(65536));
        assert_eq!(options.get(SocketOption::Dscp), None);
        assert_eq!(
            options.iter().collect::<Vec<_>>(),
            vec![
                (SocketOption::SendBufferSize, 65536),
                (SocketOption::NoDelay, 1)
            ]
        );
    }
}
