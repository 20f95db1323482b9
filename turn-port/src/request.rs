// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The requests a [`TurnPort`] sends to the TURN server.
//!
//! Each request knows how to write itself and how to act on the server's answer. The port keeps
//! the outstanding requests keyed by transaction and hands the answer back to the request that
//! produced it.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun_proto::types::attribute::{ErrorCode, Nonce, Realm, Software, Username, XorMappedAddress};
use stun_proto::types::message::{
    IntegrityAlgorithm, LongTermCredentials, Message, MessageIntegrityCredentials,
    MessageWriteVec, Method, TransactionId,
};
use stun_proto::types::prelude::*;
use tracing::{info, trace, warn};
use turn_types::attribute::{
    ChannelNumber, Lifetime, RequestedTransport, XorPeerAddress, XorRelayedAddress,
};
use turn_types::message::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, REFRESH};

use crate::entry::EntryId;
use crate::error::{write_error, AllocateError, RequestError};
use crate::port::TurnPort;

/// The long-term credentials and nonce in use with the server.
#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) credentials: LongTermCredentials,
    pub(crate) nonce: String,
}

/// A request written and ready to be handed to the STUN agent.
#[derive(Debug)]
pub(crate) struct PreparedRequest {
    pub(crate) transaction_id: TransactionId,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AllocateRequest {
    stale_nonce_retries: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RefreshRequest {
    /// Only set when releasing the allocation.
    lifetime: Option<u32>,
    stale_nonce_retries: u32,
}

impl RefreshRequest {
    pub(crate) fn release() -> Self {
        Self {
            lifetime: Some(0),
            stale_nonce_retries: 0,
        }
    }

    fn is_release(&self) -> bool {
        self.lifetime == Some(0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CreatePermissionRequest {
    entry: EntryId,
    peer: SocketAddr,
    stale_nonce_retries: u32,
}

impl CreatePermissionRequest {
    pub(crate) fn new(entry: EntryId, peer: SocketAddr) -> Self {
        Self {
            entry,
            peer,
            stale_nonce_retries: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelBindRequest {
    entry: EntryId,
    peer: SocketAddr,
    channel: u16,
    stale_nonce_retries: u32,
}

impl ChannelBindRequest {
    pub(crate) fn new(entry: EntryId, peer: SocketAddr, channel: u16) -> Self {
        Self {
            entry,
            peer,
            channel,
            stale_nonce_retries: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TurnRequest {
    Allocate(AllocateRequest),
    Refresh(RefreshRequest),
    CreatePermission(CreatePermissionRequest),
    ChannelBind(ChannelBindRequest),
}

impl From<AllocateRequest> for TurnRequest {
    fn from(value: AllocateRequest) -> Self {
        Self::Allocate(value)
    }
}

impl From<RefreshRequest> for TurnRequest {
    fn from(value: RefreshRequest) -> Self {
        Self::Refresh(value)
    }
}

impl From<CreatePermissionRequest> for TurnRequest {
    fn from(value: CreatePermissionRequest) -> Self {
        Self::CreatePermission(value)
    }
}

impl From<ChannelBindRequest> for TurnRequest {
    fn from(value: ChannelBindRequest) -> Self {
        Self::ChannelBind(value)
    }
}

impl TurnRequest {
    pub(crate) fn method(&self) -> Method {
        match self {
            Self::Allocate(_) => ALLOCATE,
            Self::Refresh(_) => REFRESH,
            Self::CreatePermission(_) => CREATE_PERMISSION,
            Self::ChannelBind(_) => CHANNEL_BIND,
        }
    }

    /// The entry this request acts on, if any.
    pub(crate) fn entry(&self) -> Option<EntryId> {
        match self {
            Self::CreatePermission(permission) => Some(permission.entry),
            Self::ChannelBind(bind) => Some(bind.entry),
            Self::Allocate(_) | Self::Refresh(_) => None,
        }
    }

    fn stale_nonce_retries_mut(&mut self) -> &mut u32 {
        match self {
            Self::Allocate(allocate) => &mut allocate.stale_nonce_retries,
            Self::Refresh(refresh) => &mut refresh.stale_nonce_retries,
            Self::CreatePermission(permission) => &mut permission.stale_nonce_retries,
            Self::ChannelBind(bind) => &mut bind.stale_nonce_retries,
        }
    }

    /// Write the request.
    ///
    /// Credentials are attached whenever a realm and nonce are known, which is the case for every
    /// request apart from the very first allocation.
    pub(crate) fn prepare(
        &self,
        auth: Option<&AuthContext>,
        software: Option<&str>,
    ) -> Result<PreparedRequest, RequestError> {
        let mut builder = Message::builder_request(self.method(), MessageWriteVec::new());
        let transaction_id = builder.transaction_id();

        match self {
            Self::Allocate(_) => {
                let requested = RequestedTransport::new(RequestedTransport::UDP);
                builder.add_attribute(&requested).map_err(write_error)?;
            }
            Self::Refresh(refresh) => {
                if let Some(lifetime) = refresh.lifetime {
                    let lifetime = Lifetime::new(lifetime);
                    builder.add_attribute(&lifetime).map_err(write_error)?;
                }
            }
            Self::CreatePermission(permission) => {
                let xor_peer_address = XorPeerAddress::new(permission.peer, transaction_id);
                builder
                    .add_attribute(&xor_peer_address)
                    .map_err(write_error)?;
            }
            Self::ChannelBind(bind) => {
                let channel_no = ChannelNumber::new(bind.channel);
                builder.add_attribute(&channel_no).map_err(write_error)?;
                let xor_peer_address = XorPeerAddress::new(bind.peer, transaction_id);
                builder
                    .add_attribute(&xor_peer_address)
                    .map_err(write_error)?;
            }
        }

        if let Some(software) = software {
            let software = Software::new(software).map_err(write_error)?;
            builder.add_attribute(&software).map_err(write_error)?;
        }

        if let Some(auth) = auth {
            let username = Username::new(auth.credentials.username()).map_err(write_error)?;
            builder.add_attribute(&username).map_err(write_error)?;
            let realm = Realm::new(auth.credentials.realm()).map_err(write_error)?;
            builder.add_attribute(&realm).map_err(write_error)?;
            let nonce = Nonce::new(&auth.nonce).map_err(write_error)?;
            builder.add_attribute(&nonce).map_err(write_error)?;
            builder
                .add_message_integrity(
                    &MessageIntegrityCredentials::LongTerm(auth.credentials.clone()),
                    IntegrityAlgorithm::Sha1,
                )
                .map_err(write_error)?;
        }

        Ok(PreparedRequest {
            transaction_id,
            data: builder.finish(),
        })
    }

    /// Act on a success response.
    pub(crate) fn on_response(self, port: &mut TurnPort, msg: &Message<'_>, now: Instant) {
        let transaction_id = msg.transaction_id();
        match self {
            Self::Allocate(_) => {
                let Ok(mapped) = msg.attribute::<XorMappedAddress>() else {
                    warn!("Allocate response is missing XOR-MAPPED-ADDRESS");
                    return;
                };
                let Ok(relayed) = msg.attribute::<XorRelayedAddress>() else {
                    warn!("Allocate response is missing XOR-RELAYED-ADDRESS");
                    return;
                };
                let Ok(lifetime) = msg.attribute::<Lifetime>() else {
                    warn!("Allocate response is missing LIFETIME");
                    return;
                };
                if port.on_allocate_success(
                    relayed.addr(transaction_id),
                    mapped.addr(transaction_id),
                    now,
                ) {
                    port.schedule_refresh(lifetime.seconds(), now);
                }
            }
            Self::Refresh(refresh) => {
                if refresh.is_release() {
                    info!("Allocation released");
                    port.on_release_complete();
                    return;
                }
                let Ok(lifetime) = msg.attribute::<Lifetime>() else {
                    warn!("Refresh response is missing LIFETIME");
                    return;
                };
                info!(lifetime = lifetime.seconds(), "Allocation refreshed");
                port.schedule_refresh(lifetime.seconds(), now);
            }
            Self::CreatePermission(permission) => {
                port.on_create_permission_success(permission.entry, permission.peer, now);
            }
            Self::ChannelBind(bind) => {
                port.on_channel_bind_success(bind.entry, bind.peer, now);
            }
        }
    }

    /// Act on an error response carrying `code`.
    pub(crate) fn on_error_response(
        mut self,
        port: &mut TurnPort,
        msg: &Message<'_>,
        code: u16,
        now: Instant,
    ) {
        if code == ErrorCode::STALE_NONCE {
            let max_retries = port.config().max_stale_nonce_retries;
            let retries = self.stale_nonce_retries_mut();
            if *retries < max_retries {
                *retries += 1;
                if port.update_nonce(msg) {
                    info!(method = ?self.method(), "Nonce is stale, retrying with the new nonce");
                    port.send_request(self, Duration::ZERO, now);
                    return;
                }
            } else {
                warn!(method = ?self.method(), "Nonce stale after {max_retries} retries");
            }
        }

        match self {
            Self::Allocate(allocate) => {
                if code != ErrorCode::UNAUTHORIZED {
                    warn!(code, "Allocate request failed");
                    port.on_allocate_error(AllocateError::Rejected(code));
                    return;
                }
                if port.has_credentials() {
                    warn!("Server rejected the credentials");
                    port.on_allocate_error(AllocateError::Unauthorized);
                    return;
                }
                if !port.update_nonce(msg) {
                    port.on_allocate_error(AllocateError::MalformedChallenge);
                    return;
                }
                trace!("Retrying allocate with credentials");
                port.send_request(allocate, Duration::ZERO, now);
            }
            Self::Refresh(refresh) => {
                warn!(code, "Refresh request failed");
                if refresh.is_release() {
                    port.on_release_complete();
                }
            }
            Self::CreatePermission(permission) => {
                port.on_create_permission_error(permission.entry, permission.peer, code);
            }
            Self::ChannelBind(bind) => {
                port.on_channel_bind_error(bind.entry, bind.peer, code);
            }
        }
    }

    /// Act on the request never being answered.
    pub(crate) fn on_timeout(self, port: &mut TurnPort) {
        match self {
            Self::Allocate(_) => {
                warn!("Allocate request timed out");
                port.on_allocate_error(AllocateError::Timeout);
            }
            Self::Refresh(refresh) => {
                warn!("Refresh request timed out");
                if refresh.is_release() {
                    port.on_release_complete();
                }
            }
            Self::CreatePermission(permission) => {
                warn!(peer = %permission.peer, "Create permission request timed out");
            }
            Self::ChannelBind(bind) => {
                warn!(
                    peer = %bind.peer,
                    channel = bind.channel,
                    "Channel bind request timed out"
                );
            }
        }
    }
}
