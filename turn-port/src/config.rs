// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration of a [`TurnPort`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use turn_types::TurnCredentials;

use crate::address::ProtocolAddress;
use crate::port::TurnPort;
use crate::socket::{
    AsyncResolver, PacketSocketFactory, SocketOption, SocketOptions, TcpSocketOptions,
};

/// The default number of times a request is retried after a stale nonce error.
const DEFAULT_MAX_STALE_NONCE_RETRIES: u32 = 5;

/// Configuration of a [`TurnPort`].
#[derive(Debug, Clone)]
pub struct TurnPortConfig {
    /// The local IP address sockets are bound to.
    pub local_ip: IpAddr,
    /// The range of local ports a UDP socket may bind to. `0..=0` allows any port.
    pub port_range: RangeInclusive<u16>,
    /// The SOFTWARE attribute added to every request.
    pub software: Option<String>,
    /// How many times a single request is retried after a stale nonce error.
    pub max_stale_nonce_retries: u32,
    /// Options applied to a socket when it is created.
    pub socket_options: SocketOptions,
    /// How TCP and TLS connections are set up.
    pub tcp_options: TcpSocketOptions,
}

impl Default for TurnPortConfig {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: 0..=0,
            software: None,
            max_stale_nonce_retries: DEFAULT_MAX_STALE_NONCE_RETRIES,
            socket_options: SocketOptions::default(),
            tcp_options: TcpSocketOptions::default(),
        }
    }
}

/// Builder for a [`TurnPort`].
#[derive(Debug)]
pub struct TurnPortBuilder {
    server: ProtocolAddress,
    credentials: TurnCredentials,
    config: TurnPortConfig,
    resolver: Option<Box<dyn AsyncResolver>>,
}

impl TurnPortBuilder {
    pub(crate) fn new(server: ProtocolAddress, credentials: TurnCredentials) -> Self {
        Self {
            server,
            credentials,
            config: TurnPortConfig::default(),
            resolver: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TurnPortConfig) -> Self {
        self.config = config;
        self
    }

    /// The local IP address sockets are bound to.
    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.config.local_ip = ip;
        self
    }

    /// The range of local ports a UDP socket may bind to.
    pub fn port_range(mut self, ports: RangeInclusive<u16>) -> Self {
        self.config.port_range = ports;
        self
    }

    /// Add a SOFTWARE attribute to every request.
    pub fn software(mut self, software: impl Into<String>) -> Self {
        self.config.software = Some(software.into());
        self
    }

    /// How many times a single request is retried after a stale nonce error.
    pub fn max_stale_nonce_retries(mut self, retries: u32) -> Self {
        self.config.max_stale_nonce_retries = retries;
        self
    }

    /// Apply a socket option when the socket is created.
    pub fn socket_option(mut self, option: SocketOption, value: i32) -> Self {
        self.config.socket_options.set(option, value);
        self
    }

    /// Connect to a TCP or TLS server through a proxy.
    pub fn proxy(mut self, proxy: SocketAddr, user_agent: Option<String>) -> Self {
        self.config.tcp_options.proxy = Some(proxy);
        self.config.tcp_options.user_agent = user_agent;
        self
    }

    /// The resolver used when the server is configured with a host name.
    pub fn resolver(mut self, resolver: Box<dyn AsyncResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Construct the [`TurnPort`]. Sockets are created through `factory`.
    pub fn build(self, factory: Box<dyn PacketSocketFactory>) -> TurnPort {
        TurnPort::new(
            self.server,
            self.credentials,
            self.config,
            factory,
            self.resolver,
        )
    }
}
