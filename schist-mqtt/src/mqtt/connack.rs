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

use log::*;
use std::collections::VecDeque;
use std::fmt;

const CONNACK_SESSION_PRESENT_FLAG : u8 = 1;

pub(crate) fn write_connack_encoding_steps(packet: &ConnackPacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    let acknowledge_flags = if packet.session_present { CONNACK_SESSION_PRESENT_FLAG } else { 0 };

    push_fixed_header(steps, CONNACK_FIRST_BYTE, 2);
    steps.push_back(EncodingStep::Uint8(acknowledge_flags));
    steps.push_back(EncodingStep::Uint8(packet.return_code as u8));

    Ok(())
}

pub(crate) fn decode_connack_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {

    if first_byte != CONNACK_FIRST_BYTE {
        let message = "decode_connack_packet - invalid first byte";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    if packet_body.len() != 2 {
        let message = "decode_connack_packet - connack packet invalid length";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let mut packet = ConnackPacket { ..Default::default() };

    let mut flags: u8 = 0;
    let mut mutable_body = decode_u8(packet_body, &mut flags)?;

    if flags == CONNACK_SESSION_PRESENT_FLAG {
        packet.session_present = true;
    } else if flags != 0 {
        let message = "decode_connack_packet - reserved bits set in flags field";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    mutable_body = decode_u8_as_enum(mutable_body, &mut packet.return_code, ConnectReturnCode::try_from)?;
    if !mutable_body.is_empty() {
        let message = "decode_connack_packet - trailing bytes";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    if packet.session_present && !packet.return_code.is_success() {
        let message = "decode_connack_packet - session present set on a failed connection";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Connack(packet)))
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = PacketFields::begin(f, "ConnackPacket")?;
        fields.value("session_present", self.session_present)?;
        fields.value("return_code", self.return_code)?;
        fields.finish()
    }
}
