// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::SocketAddr;

use crate::address::ProtocolType;

/// Reasons an allocation could not be created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AllocateError {
    /// No username or password was configured.
    #[error("A username and password are required to allocate on a TURN server")]
    MissingCredentials,
    /// The server address is of a different IP family than the local address.
    #[error("The server address {0} is not compatible with the local address")]
    IncompatibleAddress(SocketAddr),
    /// The server host name could not be resolved.
    #[error("Failed to resolve the server address {0}")]
    ResolveFailed(String),
    /// The socket towards the server could not be created.
    #[error("Failed to create a socket: {0}")]
    SocketCreation(std::io::ErrorKind),
    /// The connection to the server closed before the allocation succeeded.
    #[error("The connection to the server was closed")]
    SocketClosed,
    /// The server rejected the credentials.
    #[error("The server rejected the provided credentials")]
    Unauthorized,
    /// The server challenge did not contain a realm and nonce.
    #[error("The authentication challenge was missing the realm or nonce")]
    MalformedChallenge,
    /// The server rejected the allocation with the provided error code.
    #[error("The server rejected the allocation with error code {0}")]
    Rejected(u16),
    /// The server never answered.
    #[error("The allocation request timed out")]
    Timeout,
    /// The allocation request could not be written.
    #[error("Failed to construct the allocation request: {0}")]
    Request(#[from] RequestError),
}

/// Errors produced when writing a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    /// A STUN message or attribute could not be written.
    #[error("Failed to write a STUN message: {0}")]
    Write(String),
    /// The payload is larger than a single TURN message can carry.
    #[error("A payload of {0} bytes is too large to relay")]
    TooLarge(usize),
}

pub(crate) fn write_error<E: std::fmt::Display>(err: E) -> RequestError {
    RequestError::Write(err.to_string())
}

/// Errors produced when attempting to send to a peer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    /// There is no connection for the peer address.
    #[error("There is no connection for the peer address {0}")]
    NoEntry(SocketAddr),
    /// The allocation has not completed yet.
    #[error("The allocation is not ready to send data")]
    WouldBlock,
    /// The data could not be framed.
    #[error("Failed to frame the data: {0}")]
    Request(#[from] RequestError),
    /// The socket failed to send the data.
    #[error("Failed to send data: {0}")]
    Socket(#[from] std::io::Error),
}

/// Errors produced when attempting to create a connection to a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CreateConnectionError {
    /// Only UDP peers can be reached through the relay.
    #[error("Peers over {0} cannot be reached through the relay")]
    UnsupportedProtocol(ProtocolType),
    /// The peer address is of a different IP family than the port.
    #[error("The peer address {0} is not compatible with the relay")]
    IncompatibleAddress(SocketAddr),
    /// Every channel number has been handed out.
    #[error("No channel numbers are available")]
    ChannelsExhausted,
}

/// Errors produced when attempting to release an allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ReleaseError {
    /// There is no allocation on the TURN server.
    #[error("There is no allocation on the TURN server")]
    NoAllocation,
}
