// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-peer permission and channel binding state.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::address::ProtocolType;
use crate::error::RequestError;
use crate::framing;
use crate::port::ConnectionId;

const PERMISSION_TIMEOUT_SECS: u64 = 300;
const PERMISSION_EXPIRY_BUFFER_SECS: u64 = 60;

/// Delay after a permission is installed before it is refreshed.
static PERMISSION_REFRESH_DELAY: Duration =
    Duration::from_secs(PERMISSION_TIMEOUT_SECS - PERMISSION_EXPIRY_BUFFER_SECS);
/// Delay after a successful channel bind before binding again.
pub(crate) static CHANNEL_REBIND_DELAY: Duration =
    Duration::from_secs(PERMISSION_TIMEOUT_SECS - PERMISSION_EXPIRY_BUFFER_SECS);

/// Identifies one [`TurnEntry`] for as long as it is alive. Never reused within a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EntryId(u64);

impl EntryId {
    pub(crate) fn new(generation: u64) -> Self {
        Self(generation)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

/// The channel binding state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    /// No channel has been requested.
    Unbound,
    /// A channel bind request is outstanding.
    Binding,
    /// The channel is bound and data is sent as ChannelData.
    Bound,
}

/// The permission state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    /// The permission has been requested but not confirmed.
    Requested,
    /// The server installed the permission.
    Granted,
    /// The server refused the permission with the contained error code.
    Failed(u16),
}

/// A timer of an entry that has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryTimer {
    Rebind,
    RefreshPermission,
}

/// The framed result of [`TurnEntry::send`].
#[derive(Debug)]
pub(crate) struct EntryFrame {
    pub(crate) data: Vec<u8>,
    /// A channel bind should be requested before the frame is sent.
    pub(crate) bind_channel: bool,
}

#[derive(Debug)]
pub(crate) struct TurnEntry {
    id: EntryId,
    connections: Vec<ConnectionId>,
    channel_id: u16,
    ext_addr: SocketAddr,
    state: BindState,
    permission: PermissionState,
    rebind_at: Option<Instant>,
    permission_refresh_at: Option<Instant>,
}

impl TurnEntry {
    pub(crate) fn new(
        id: EntryId,
        connection: ConnectionId,
        channel_id: u16,
        ext_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            connections: vec![connection],
            channel_id,
            ext_addr,
            state: BindState::Unbound,
            permission: PermissionState::Requested,
            rebind_at: None,
            permission_refresh_at: None,
        }
    }

    pub(crate) fn id(&self) -> EntryId {
        self.id
    }

    /// The first connection created for this peer. Received data is reported against it.
    pub(crate) fn connection(&self) -> ConnectionId {
        self.connections[0]
    }

    pub(crate) fn has_connection(&self, connection: ConnectionId) -> bool {
        self.connections.contains(&connection)
    }

    pub(crate) fn add_connection(&mut self, connection: ConnectionId) {
        self.connections.push(connection);
    }

    pub(crate) fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub(crate) fn ext_addr(&self) -> SocketAddr {
        self.ext_addr
    }

    pub(crate) fn state(&self) -> BindState {
        self.state
    }

    pub(crate) fn permission(&self) -> PermissionState {
        self.permission
    }

    /// Frame `data` for this peer.
    ///
    /// Until the channel is bound, data is wrapped in a Send indication and the first payload
    /// moves the entry to [`BindState::Binding`].
    pub(crate) fn send(
        &mut self,
        data: &[u8],
        payload: bool,
        transport: ProtocolType,
    ) -> Result<EntryFrame, RequestError> {
        if self.state == BindState::Bound {
            return Ok(EntryFrame {
                data: framing::write_channel_data(
                    self.channel_id,
                    data,
                    transport == ProtocolType::Tcp,
                )?,
                bind_channel: false,
            });
        }

        let data = framing::write_send_indication(self.ext_addr, data)?;
        let bind_channel = payload && self.state == BindState::Unbound;
        if bind_channel {
            self.state = BindState::Binding;
        }
        Ok(EntryFrame { data, bind_channel })
    }

    pub(crate) fn on_create_permission_success(&mut self, now: Instant) {
        info!(peer = %self.ext_addr, "Permission created");
        self.permission = PermissionState::Granted;
        // a bound channel keeps the permission alive
        if self.state != BindState::Bound {
            self.permission_refresh_at = Some(now + PERMISSION_REFRESH_DELAY);
        }
    }

    pub(crate) fn on_create_permission_error(&mut self, code: u16) {
        warn!(peer = %self.ext_addr, code, "Failed to create permission");
        self.permission = PermissionState::Failed(code);
        self.permission_refresh_at = None;
    }

    pub(crate) fn on_channel_bind_success(&mut self, now: Instant) {
        info!(peer = %self.ext_addr, channel = self.channel_id, "Channel bound");
        self.state = BindState::Bound;
        self.permission = PermissionState::Granted;
        self.permission_refresh_at = None;
        self.rebind_at = Some(now + CHANNEL_REBIND_DELAY);
    }

    pub(crate) fn on_channel_bind_error(&mut self, code: u16) {
        warn!(
            peer = %self.ext_addr,
            channel = self.channel_id,
            code,
            "Failed to bind channel, continuing with send indications"
        );
    }

    pub(crate) fn poll_timer(&mut self, now: Instant) -> Option<EntryTimer> {
        if self.rebind_at.is_some_and(|at| at <= now) {
            self.rebind_at = None;
            return Some(EntryTimer::Rebind);
        }
        if self.permission_refresh_at.is_some_and(|at| at <= now) {
            self.permission_refresh_at = None;
            return Some(EntryTimer::RefreshPermission);
        }
        None
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.rebind_at, self.permission_refresh_at) {
            (Some(rebind), Some(refresh)) => Some(rebind.min(refresh)),
            (rebind, refresh) => rebind.or(refresh),
        }
    }
}
