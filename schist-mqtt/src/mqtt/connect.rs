/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{SchistError, SchistResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::validate::utils::*;

use log::*;
use std::collections::VecDeque;
use std::fmt;

fn compute_connect_flags(packet: &ConnectPacket) -> u8 {
    let mut flags: u8 = 0;
    if packet.clean_start {
        flags |= CONNECT_PACKET_CLEAN_START_FLAG_MASK;
    }

    if let Some(will) = &packet.will {
        flags |= CONNECT_PACKET_HAS_WILL_FLAG_MASK;
        flags |= (will.qos as u8) << CONNECT_PACKET_WILL_QOS_FLAG_SHIFT;
        if will.retain {
            flags |= CONNECT_PACKET_WILL_RETAIN_FLAG_MASK;
        }
    }

    if packet.password.is_some() {
        flags |= CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK;
    }

    if packet.username.is_some() {
        flags |= CONNECT_PACKET_HAS_USERNAME_FLAG_MASK;
    }

    flags
}

// protocol header (7) + connect flags (1) + keep alive (2)
const CONNECT_VARIABLE_HEADER_LENGTH : usize = 10;

fn length_prefixed_size(length: usize, field_name: &str) -> SchistResult<usize> {
    check_length_prefixed_field(length, field_name)?;
    Ok(2 + length)
}

fn compute_connect_packet_remaining_length(packet: &ConnectPacket) -> SchistResult<u32> {
    let mut payload_length = length_prefixed_size(packet.client_id.len(), "client id")?;

    if let Some(will) = &packet.will {
        payload_length += length_prefixed_size(will.topic.len(), "will topic")?;
        payload_length += length_prefixed_size(will.payload.as_ref().map_or(0, |payload| payload.len()), "will payload")?;
    }

    if let Some(username) = &packet.username {
        payload_length += length_prefixed_size(username.len(), "username")?;
    }

    if let Some(password) = &packet.password {
        payload_length += length_prefixed_size(password.len(), "password")?;
    }

    check_remaining_length(CONNECT_VARIABLE_HEADER_LENGTH + payload_length)
}

pub(crate) fn write_connect_encoding_steps(packet: &ConnectPacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    let total_remaining_length = compute_connect_packet_remaining_length(packet)?;

    push_fixed_header(steps, CONNECT_FIRST_BYTE, total_remaining_length);
    steps.push_back(EncodingStep::Field(PacketField::ProtocolHeader, 0));
    steps.push_back(EncodingStep::Uint8(compute_connect_flags(packet)));
    steps.push_back(EncodingStep::Uint16(packet.keep_alive_interval_seconds));

    push_length_prefixed_field(steps, PacketField::ClientId, packet.client_id.len());

    if let Some(will) = &packet.will {
        push_length_prefixed_field(steps, PacketField::WillTopic, will.topic.len());
        push_length_prefixed_field(steps, PacketField::WillPayload, will.payload.as_ref().map_or(0, |payload| payload.len()));
    }

    if let Some(username) = &packet.username {
        push_length_prefixed_field(steps, PacketField::Username, username.len());
    }

    if let Some(password) = &packet.password {
        push_length_prefixed_field(steps, PacketField::Password, password.len());
    }

    Ok(())
}

pub(crate) fn decode_connect_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {
    if first_byte != CONNECT_FIRST_BYTE {
        let message = "decode_connect_packet - invalid first byte";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let mut packet = ConnectPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    let protocol_header = protocol_header_bytes();
    if mutable_body.len() < protocol_header.len() {
        let message = "decode_connect_packet - packet too short";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let (protocol_bytes, rest) = mutable_body.split_at(protocol_header.len());
    mutable_body = rest;

    if protocol_bytes != protocol_header {
        let message = "decode_connect_packet - invalid protocol";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let mut connect_flags : u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut connect_flags)?;

    if (connect_flags & CONNECT_PACKET_RESERVED_FLAG_MASK) != 0 {
        let message = "decode_connect_packet - connect flags reserved bit set";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    packet.clean_start = (connect_flags & CONNECT_PACKET_CLEAN_START_FLAG_MASK) != 0;
    let has_will = (connect_flags & CONNECT_PACKET_HAS_WILL_FLAG_MASK) != 0;
    let will_retain = (connect_flags & CONNECT_PACKET_WILL_RETAIN_FLAG_MASK) != 0;
    let will_qos = QualityOfService::try_from((connect_flags >> CONNECT_PACKET_WILL_QOS_FLAG_SHIFT) & QOS_MASK)?;

    if !has_will && (will_retain || will_qos != QualityOfService::AtMostOnce) {
        let message = "decode_connect_packet - no will but has will flags set";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let has_username = (connect_flags & CONNECT_PACKET_HAS_USERNAME_FLAG_MASK) != 0;
    let has_password = (connect_flags & CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK) != 0;

    if has_password && !has_username {
        let message = "decode_connect_packet - password flag set without username flag";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    mutable_body = decode_u16(mutable_body, &mut packet.keep_alive_interval_seconds)?;
    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.client_id)?;

    if has_will {
        let mut will = PublishPacket {
            qos: will_qos,
            retain: will_retain,
            ..Default::default()
        };

        mutable_body = decode_length_prefixed_string(mutable_body, &mut will.topic)?;

        let mut payload = Vec::new();
        mutable_body = decode_length_prefixed_bytes(mutable_body, &mut payload)?;
        if !payload.is_empty() {
            will.payload = Some(payload);
        }

        packet.will = Some(will);
    }

    if has_username {
        let mut username = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut username)?;
        packet.username = Some(username);
    }

    if has_password {
        let mut password = Vec::new();
        mutable_body = decode_length_prefixed_bytes(mutable_body, &mut password)?;
        packet.password = Some(password);
    }

    if !mutable_body.is_empty() {
        let message = "decode_connect_packet - body length does not match expected overall packet length";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Connect(packet)))
}

pub(crate) fn validate_connect_packet_outbound(packet: &ConnectPacket) -> SchistResult<()> {

    validate_string_length(&packet.client_id, PacketType::Connect, "Connect", "client_id")?;

    if packet.client_id.is_empty() && !packet.clean_start {
        error!("ConnectPacket Outbound Validation - an empty client id requires a clean session");
        return Err(SchistError::new_packet_validation(PacketType::Connect, "empty client id without clean session"));
    }

    validate_optional_string_length(&packet.username, PacketType::Connect, "Connect", "username")?;
    validate_optional_binary_length(&packet.password, PacketType::Connect, "Connect", "password")?;

    if packet.password.is_some() && packet.username.is_none() {
        error!("ConnectPacket Outbound Validation - password set without a username");
        return Err(SchistError::new_packet_validation(PacketType::Connect, "password set without a username"));
    }

    if let Some(will) = &packet.will {
        if !is_valid_topic(&will.topic) {
            error!("ConnectPacket Outbound Validation - invalid will topic");
            return Err(SchistError::new_packet_validation(PacketType::Connect, "invalid will topic"));
        }

        validate_optional_binary_length(&will.payload, PacketType::Connect, "Connect", "will payload")?;
    }

    Ok(())
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = PacketFields::begin(f, "ConnectPacket")?;
        fields.value("keep_alive_interval_seconds", self.keep_alive_interval_seconds)?;
        fields.value("clean_start", self.clean_start)?;
        fields.string("client_id", &self.client_id)?;
        fields.optional_string("username", self.username.as_deref())?;
        fields.redacted("password", self.password.is_some())?;

        if let Some(will) = &self.will {
            fields.open_group("will")?;
            fields.string("topic", &will.topic)?;
            fields.value("qos", will.qos)?;
            fields.value("retain", will.retain)?;
            fields.optional_bytes("payload", will.payload.as_deref())?;
            fields.close_group()?;
        }

        fields.finish()
    }
}
