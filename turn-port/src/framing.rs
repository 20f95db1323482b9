// Copyright (C) 2025 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Framing of application data relayed through the TURN server.

use std::net::SocketAddr;

use byteorder::{BigEndian, ByteOrder};
use stun_proto::types::message::{
    Message, MessageClass, MessageHeader, MessageType, MessageWriteVec, TransactionId,
};
use stun_proto::types::prelude::*;
use turn_types::attribute::{Data as AData, XorPeerAddress};
use turn_types::channel::ChannelData;
use turn_types::message::SEND;

use crate::error::{write_error, RequestError};

/// The first channel number that can be bound.
pub const TURN_CHANNEL_NUMBER_START: u16 = 0x4000;
/// The last channel number that can be bound.
pub const TURN_CHANNEL_NUMBER_END: u16 = 0x7FFF;

pub(crate) const CHANNEL_HEADER_LEN: usize = 4;

/// Room left for XOR-PEER-ADDRESS and the DATA header within a 16-bit message length.
const MAX_INDICATION_PAYLOAD: usize = u16::MAX as usize - 32;

/// Whether `data` starts with a ChannelData header (the two most significant bits are `01`).
pub(crate) fn is_channel_data(data: &[u8]) -> bool {
    data.len() >= 2 && BigEndian::read_u16(data) & 0xC000 == 0x4000
}

/// Split a ChannelData frame into its channel number and payload.
///
/// Trailing bytes beyond the declared length (TCP padding) are allowed and discarded.
pub(crate) fn parse_channel_data(data: &[u8]) -> Option<(u16, &[u8])> {
    let channel = ChannelData::parse(data).ok()?;
    // the payload borrow of `ChannelData` is tied to the parsed value, not to `data`
    let len = channel.data().len();
    Some((channel.id(), &data[CHANNEL_HEADER_LEN..CHANNEL_HEADER_LEN + len]))
}

/// Write `payload` behind a ChannelData header for `channel`.
///
/// Over stream transports the frame is padded to a multiple of four bytes.
pub(crate) fn write_channel_data(
    channel: u16,
    payload: &[u8],
    pad: bool,
) -> Result<Vec<u8>, RequestError> {
    if payload.len() > u16::MAX as usize {
        return Err(RequestError::TooLarge(payload.len()));
    }
    let len = CHANNEL_HEADER_LEN + payload.len();
    let frame_len = if pad { (len + 3) & !3 } else { len };
    let mut out = vec![0; frame_len];
    BigEndian::write_u16(&mut out[..2], channel);
    BigEndian::write_u16(&mut out[2..4], payload.len() as u16);
    out[CHANNEL_HEADER_LEN..len].copy_from_slice(payload);
    Ok(out)
}

/// Wrap `payload` in a Send indication towards `peer`.
pub(crate) fn write_send_indication(
    peer: SocketAddr,
    payload: &[u8],
) -> Result<Vec<u8>, RequestError> {
    if payload.len() > MAX_INDICATION_PAYLOAD {
        return Err(RequestError::TooLarge(payload.len()));
    }
    let transaction_id = TransactionId::generate();
    let xor_peer_address = XorPeerAddress::new(peer, transaction_id);
    let data = AData::new(payload);
    let mut msg = Message::builder(
        MessageType::from_class_method(MessageClass::Indication, SEND),
        transaction_id,
        MessageWriteVec::with_capacity(
            MessageHeader::LENGTH + xor_peer_address.padded_len() + data.padded_len(),
        ),
    );
    msg.add_attribute(&xor_peer_address).map_err(write_error)?;
    msg.add_attribute(&data).map_err(write_error)?;
    Ok(msg.finish())
}
