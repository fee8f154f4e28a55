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

fn compute_publish_packet_remaining_length(packet: &PublishPacket) -> SchistResult<u32> {
    /*
     * Remaining Length:
     * Variable Header
     *  - Topic Name
     *  - Packet Identifier (qos1+)
     * Payload
     */
    check_length_prefixed_field(packet.topic.len(), "publish topic")?;

    let mut total_remaining_length : usize = 2 + packet.topic.len();

    if packet.qos != QualityOfService::AtMostOnce {
        total_remaining_length += 2;
    }

    if let Some(payload) = &packet.payload {
        total_remaining_length += payload.len();
    }

    check_remaining_length(total_remaining_length)
}

/*
 * Fixed Header
 * byte 1:
 *  bits 4-7: MQTT Control Packet Type
 *  bit 3: DUP flag
 *  bit 1-2: QoS level
 *  bit 0: RETAIN
 * byte 2-x: Remaining Length as Variable Byte Integer (1-4 bytes)
 */
fn compute_publish_fixed_header_first_byte(packet: &PublishPacket) -> u8 {
    let mut first_byte: u8 = PACKET_TYPE_PUBLISH << 4;

    if packet.duplicate {
        first_byte |= PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG;
    }

    first_byte |= (packet.qos as u8) << 1;

    if packet.retain {
        first_byte |= PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG;
    }

    first_byte
}

pub(crate) fn write_publish_encoding_steps(packet: &PublishPacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    if !is_valid_topic(&packet.topic) {
        error!("PublishPacket Encode - invalid topic");
        return Err(SchistError::new_encoding_failure("invalid publish topic"));
    }

    if packet.qos != QualityOfService::AtMostOnce {
        check_packet_id(packet.packet_id, "PublishPacket")?;
    }

    let total_remaining_length = compute_publish_packet_remaining_length(packet)?;

    push_fixed_header(steps, compute_publish_fixed_header_first_byte(packet), total_remaining_length);
    push_length_prefixed_field(steps, PacketField::PublishTopic, packet.topic.len());

    if packet.qos != QualityOfService::AtMostOnce {
        steps.push_back(EncodingStep::Uint16(packet.packet_id));
    }

    if packet.payload.is_some() {
        steps.push_back(EncodingStep::Field(PacketField::PublishPayload, 0));
    }

    Ok(())
}

pub(crate) fn decode_publish_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {

    let mut packet = PublishPacket { ..Default::default() };

    packet.duplicate = (first_byte & PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG) != 0;
    packet.retain = (first_byte & PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG) != 0;
    packet.qos = QualityOfService::try_from((first_byte >> 1) & QOS_MASK)?;

    if packet.duplicate && packet.qos == QualityOfService::AtMostOnce {
        error!("PublishPacket Decode - duplicate flag set on a qos 0 publish");
        return Err(SchistError::new_malformed_packet("duplicate flag set on a qos 0 publish"));
    }

    let mut mutable_body = packet_body;

    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.topic)?;
    if !is_valid_topic(&packet.topic) {
        error!("PublishPacket Decode - invalid topic");
        return Err(SchistError::new_malformed_packet("invalid topic in publish packet"));
    }

    if packet.qos != QualityOfService::AtMostOnce {
        mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
        if packet.packet_id == 0 {
            error!("PublishPacket Decode - qos 1+ publish with a zero packet id");
            return Err(SchistError::new_malformed_packet("qos 1+ publish with a zero packet id"));
        }
    }

    if !mutable_body.is_empty() {
        packet.payload = Some(mutable_body.to_vec());
    }

    Ok(Box::new(MqttPacket::Publish(packet)))
}

pub(crate) fn validate_publish_packet_outbound(packet: &PublishPacket) -> SchistResult<()> {

    if packet.packet_id != 0 {
        error!("PublishPacket Outbound Validation - packet id may not be set");
        return Err(SchistError::new_publish_validation("packet id is set"));
    }

    if packet.duplicate {
        error!("PublishPacket Outbound Validation - duplicate flag is set");
        return Err(SchistError::new_publish_validation("duplicate flag is set"));
    }

    if packet.topic.is_empty() {
        error!("PublishPacket Outbound Validation - empty topic");
        return Err(SchistError::new_publish_validation("topic is empty"));
    }

    if !is_valid_topic(&packet.topic) {
        error!("PublishPacket Outbound Validation - invalid topic");
        return Err(SchistError::new_publish_validation("invalid topic"));
    }

    if compute_publish_packet_remaining_length(packet).is_err() {
        error!("PublishPacket Outbound Validation - packet length exceeds the protocol maximum");
        return Err(SchistError::new_publish_validation("packet length exceeds the protocol maximum"));
    }

    Ok(())
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = PacketFields::begin(f, "PublishPacket")?;

        if self.qos != QualityOfService::AtMostOnce {
            fields.value("packet_id", self.packet_id)?;
        }

        fields.string("topic", &self.topic)?;
        fields.value("qos", self.qos)?;
        fields.value("duplicate", self.duplicate)?;
        fields.value("retain", self.retain)?;
        fields.optional_bytes("payload", self.payload.as_deref())?;

        fields.finish()
    }
}
