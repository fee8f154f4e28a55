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

pub(crate) fn write_suback_encoding_steps(packet: &SubackPacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    check_packet_id(packet.packet_id, "SubackPacket")?;

    let total_remaining_length = check_remaining_length(2 + packet.return_codes.len())?;

    push_fixed_header(steps, SUBACK_FIRST_BYTE, total_remaining_length);
    steps.push_back(EncodingStep::Uint16(packet.packet_id));
    steps.extend(packet.return_codes.iter().map(|return_code| EncodingStep::Uint8(*return_code as u8)));

    Ok(())
}

pub(crate) fn decode_suback_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {

    if first_byte != SUBACK_FIRST_BYTE {
        let message = "decode_suback_packet - invalid first byte";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let mut packet = SubackPacket { ..Default::default() };

    let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;
    if packet.packet_id == 0 {
        let message = "decode_suback_packet - packet id may not be zero";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    if mutable_body.is_empty() {
        let message = "decode_suback_packet - no return codes";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    while !mutable_body.is_empty() {
        let mut return_code = SubackReturnCode::default();
        mutable_body = decode_u8_as_enum(mutable_body, &mut return_code, SubackReturnCode::try_from)?;
        packet.return_codes.push(return_code);
    }

    Ok(Box::new(MqttPacket::Suback(packet)))
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = PacketFields::begin(f, "SubackPacket")?;
        fields.value("packet_id", self.packet_id)?;
        fields.list("return_codes", &self.return_codes, |f, return_code| write!(f, "{}", return_code))?;
        fields.finish()
    }
}
