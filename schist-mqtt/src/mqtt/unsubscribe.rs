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

fn compute_unsubscribe_packet_remaining_length(packet: &UnsubscribePacket) -> SchistResult<u32> {
    let mut total_remaining_length : usize = 2;

    for topic_filter in &packet.topic_filters {
        check_length_prefixed_field(topic_filter.len(), "unsubscribe topic filter")?;
        total_remaining_length += 2 + topic_filter.len();
    }

    check_remaining_length(total_remaining_length)
}

pub(crate) fn write_unsubscribe_encoding_steps(packet: &UnsubscribePacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    check_packet_id(packet.packet_id, "UnsubscribePacket")?;

    let total_remaining_length = compute_unsubscribe_packet_remaining_length(packet)?;

    push_fixed_header(steps, UNSUBSCRIBE_FIRST_BYTE, total_remaining_length);
    steps.push_back(EncodingStep::Uint16(packet.packet_id));

    for (index, topic_filter) in packet.topic_filters.iter().enumerate() {
        push_length_prefixed_field(steps, PacketField::UnsubscribeTopicFilter(index), topic_filter.len());
    }

    Ok(())
}

pub(crate) fn decode_unsubscribe_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {

    if first_byte != UNSUBSCRIBE_FIRST_BYTE {
        let message = "decode_unsubscribe_packet - invalid first byte";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let mut packet = UnsubscribePacket { ..Default::default() };

    let mut mutable_body = decode_u16(packet_body, &mut packet.packet_id)?;
    if packet.packet_id == 0 {
        let message = "decode_unsubscribe_packet - packet id may not be zero";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    while !mutable_body.is_empty() {
        let mut topic_filter = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut topic_filter)?;
        packet.topic_filters.push(topic_filter);
    }

    if packet.topic_filters.is_empty() {
        let message = "decode_unsubscribe_packet - no topic filters";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Unsubscribe(packet)))
}

pub(crate) fn validate_unsubscribe_packet_outbound(packet: &UnsubscribePacket) -> SchistResult<()> {

    if packet.packet_id != 0 {
        error!("UnsubscribePacket Outbound Validation - packet id may not be set");
        return Err(SchistError::new_subscribe_validation("packet id is set"));
    }

    if packet.topic_filters.is_empty() {
        error!("UnsubscribePacket Outbound Validation - empty topic filter set");
        return Err(SchistError::new_subscribe_validation("topic filter set is empty"));
    }

    for topic_filter in &packet.topic_filters {
        if !is_valid_topic_filter(topic_filter) {
            error!("UnsubscribePacket Outbound Validation - invalid topic filter \"{}\"", topic_filter);
            return Err(SchistError::new_subscribe_validation("invalid topic filter"));
        }
    }

    if compute_unsubscribe_packet_remaining_length(packet).is_err() {
        error!("UnsubscribePacket Outbound Validation - packet length exceeds the protocol maximum");
        return Err(SchistError::new_subscribe_validation("packet length exceeds the protocol maximum"));
    }

    Ok(())
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = PacketFields::begin(f, "UnsubscribePacket")?;
        fields.value("packet_id", self.packet_id)?;
        fields.list("topic_filters", &self.topic_filters, |f, topic_filter| write!(f, "\"{}\"", topic_filter))?;
        fields.finish()
    }
}
