/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

//! Encoding steps and wire-level helpers shared by the per-packet encoders.

use std::collections::VecDeque;

use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;

/// Variable-length parts of a packet that are copied straight out of the packet when encoded
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PacketField {
    ProtocolHeader,
    ClientId,
    WillTopic,
    WillPayload,
    Username,
    Password,
    PublishTopic,
    PublishPayload,
    SubscriptionTopicFilter(usize),
    UnsubscribeTopicFilter(usize),
}

static MQTT311_PROTOCOL_HEADER: [u8; 7] = [0, 4, b'M', b'Q', b'T', b'T', 4];

impl PacketField {
    fn resolve(self, packet: &MqttPacket) -> Option<&[u8]> {
        match (self, packet) {
            (PacketField::ProtocolHeader, MqttPacket::Connect(_)) => { Some(&MQTT311_PROTOCOL_HEADER) }
            (PacketField::ClientId, MqttPacket::Connect(connect)) => { Some(connect.client_id.as_bytes()) }
            (PacketField::WillTopic, MqttPacket::Connect(connect)) => {
                connect.will.as_ref().map(|will| will.topic.as_bytes())
            }
            (PacketField::WillPayload, MqttPacket::Connect(connect)) => {
                connect.will.as_ref().map(|will| will.payload.as_deref().unwrap_or(&[]))
            }
            (PacketField::Username, MqttPacket::Connect(connect)) => { connect.username.as_ref().map(|username| username.as_bytes()) }
            (PacketField::Password, MqttPacket::Connect(connect)) => { connect.password.as_deref() }
            (PacketField::PublishTopic, MqttPacket::Publish(publish)) => { Some(publish.topic.as_bytes()) }
            (PacketField::PublishPayload, MqttPacket::Publish(publish)) => { Some(publish.payload.as_deref().unwrap_or(&[])) }
            (PacketField::SubscriptionTopicFilter(index), MqttPacket::Subscribe(subscribe)) => {
                subscribe.subscriptions.get(index).map(|subscription| subscription.topic_filter.as_bytes())
            }
            (PacketField::UnsubscribeTopicFilter(index), MqttPacket::Unsubscribe(unsubscribe)) => {
                unsubscribe.topic_filters.get(index).map(|topic_filter| topic_filter.as_bytes())
            }
            _ => { None }
        }
    }
}

pub(crate) fn protocol_header_bytes() -> &'static [u8] {
    &MQTT311_PROTOCOL_HEADER
}

pub(crate) enum EncodingStep {
    Uint8(u8),
    Uint16(u16),
    Vli(u32),

    /// a packet field, resumed from a byte offset when a previous pass ran out of room
    Field(PacketField, usize),
}

/// Queues the fixed header: the first byte followed by the remaining length
pub(crate) fn push_fixed_header(steps: &mut VecDeque<EncodingStep>, first_byte: u8, remaining_length: u32) {
    steps.push_back(EncodingStep::Uint8(first_byte));
    steps.push_back(EncodingStep::Vli(remaining_length));
}

/// Queues a two byte length prefix followed by the field itself
pub(crate) fn push_length_prefixed_field(steps: &mut VecDeque<EncodingStep>, field: PacketField, length: usize) {
    steps.push_back(EncodingStep::Uint16(length as u16));
    steps.push_back(EncodingStep::Field(field, 0));
}

macro_rules! define_ack_packet_encoding_impl {
    ($function_name: ident, $packet_type: ident, $first_byte: expr) => {
        pub(crate) fn $function_name(packet: &$packet_type, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
            check_packet_id(packet.packet_id, stringify!($packet_type))?;
            push_fixed_header(steps, $first_byte, 2);
            steps.push_back(EncodingStep::Uint16(packet.packet_id));

            Ok(())
        }
    };
}

pub(crate) use define_ack_packet_encoding_impl;

macro_rules! define_empty_packet_encoding_impl {
    ($function_name: ident, $packet_type: ident, $first_byte: expr) => {
        pub(crate) fn $function_name(_: &$packet_type, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
            push_fixed_header(steps, $first_byte, 0);

            Ok(())
        }
    };
}

pub(crate) use define_empty_packet_encoding_impl;

pub(crate) static MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = (1 << 28) - 1;

pub(crate) fn compute_variable_length_integer_encode_size(value: usize) -> SchistResult<usize> {
    if value < 1usize << 7 {
        Ok(1)
    } else if value < 1usize << 14 {
        Ok(2)
    } else if value < 1usize << 21 {
        Ok(3)
    } else if value < 1usize << 28 {
        Ok(4)
    } else {
        Err(SchistError::new_encoding_failure("vli value exceeds the protocol maximum (2 ^ 28 - 1)"))
    }
}

/// Checks a computed remaining length against the protocol ceiling and narrows it for encoding
pub(crate) fn check_remaining_length(remaining_length: usize) -> SchistResult<u32> {
    if remaining_length > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(SchistError::new_encoding_failure("packet remaining length exceeds the protocol maximum (2 ^ 28 - 1)"));
    }

    Ok(remaining_length as u32)
}

/// Checks that a string or binary field fits within a two byte length prefix
pub(crate) fn check_length_prefixed_field(length: usize, field_name: &str) -> SchistResult<()> {
    if length > u16::MAX as usize {
        return Err(SchistError::new_encoding_failure(format!("{} exceeds the maximum length of a length-prefixed field", field_name)));
    }

    Ok(())
}

/// Packet id zero is reserved; every packet that carries an id must have it bound before encoding
pub(crate) fn check_packet_id(packet_id: u16, packet_name: &str) -> SchistResult<()> {
    if packet_id == 0 {
        return Err(SchistError::new_encoding_failure(format!("{} has a zero packet id", packet_name)));
    }

    Ok(())
}

fn encode_vli(value: u32, dest: &mut Vec<u8>) -> SchistResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER as u32 {
        return Err(SchistError::new_encoding_failure("vli value exceeds the protocol maximum (2 ^ 28 - 1)"));
    }

    let mut remaining = value;
    loop {
        let digit = (remaining % 128) as u8;
        remaining /= 128;

        if remaining == 0 {
            dest.push(digit);
            return Ok(());
        }

        dest.push(digit | 0x80);
    }
}

/// Copies as much of `bytes[offset..]` as fits and returns the offset to resume from, if any
fn copy_partial(bytes: &[u8], offset: usize, dest: &mut Vec<u8>) -> Option<usize> {
    let pending = bytes.get(offset..).unwrap_or(&[]);
    let writable = usize::min(dest.capacity() - dest.len(), pending.len());
    dest.extend_from_slice(&pending[..writable]);

    if writable < pending.len() {
        Some(offset + writable)
    } else {
        None
    }
}

pub(crate) fn process_encoding_step(
    steps: &mut VecDeque<EncodingStep>,
    step: EncodingStep,
    packet: &MqttPacket,
    dest: &mut Vec<u8>,
) -> SchistResult<()> {
    match step {
        EncodingStep::Uint8(value) => {
            dest.push(value);
        }
        EncodingStep::Uint16(value) => {
            dest.extend_from_slice(&value.to_be_bytes());
        }
        EncodingStep::Vli(value) => {
            encode_vli(value, dest)?;
        }
        EncodingStep::Field(field, offset) => {
            let Some(bytes) = field.resolve(packet) else {
                return Err(SchistError::new_internal_state_error(format!("{:?} is not present in the packet being encoded", field)));
            };

            if let Some(resume_offset) = copy_partial(bytes, offset, dest) {
                steps.push_front(EncodingStep::Field(field, resume_offset));
            }
        }
    }

    Ok(())
}
