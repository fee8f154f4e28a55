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

const SUBSCRIPTION_OPTIONS_RESERVED_BITS_MASK : u8 = !QOS_MASK;

fn compute_subscribe_packet_remaining_length(packet: &SubscribePacket) -> SchistResult<u32> {
    let mut total_remaining_length : usize = 2;

    for subscription in &packet.subscriptions {
        check_length_prefixed_field(subscription.topic_filter.len(), "subscription topic filter")?;
        total_remaining_length += 3 + subscription.topic_filter.len();
    }

    check_remaining_length(total_remaining_length)
}

pub(crate) fn write_subscribe_encoding_steps(packet: &SubscribePacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    check_packet_id(packet.packet_id, "SubscribePacket")?;

    let total_remaining_length = compute_subscribe_packet_remaining_length(packet)?;

    push_fixed_header(steps, SUBSCRIBE_FIRST_BYTE, total_remaining_length);
    steps.push_back(EncodingStep::Uint16(packet.packet_id));

    for (index, subscription) in packet.subscriptions.iter().enumerate() {
        push_length_prefixed_field(steps, PacketField::SubscriptionTopicFilter(index), subscription.topic_filter.len());
        steps.push_back(EncodingStep::Uint8(subscription.qos as u8));
    }

    Ok(())
}

pub(crate) fn decode_subscribe_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {

    if first_byte != SUBSCRIBE_FIRST_BYTE {
        let message = "decode_subscribe_packet - invalid first byte";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    let mut packet = SubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
    if packet.packet_id == 0 {
        let message = "decode_subscribe_packet - packet id may not be zero";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    while !mutable_body.is_empty() {
        let mut subscription = Subscription { ..Default::default() };
        mutable_body = decode_length_prefixed_string(mutable_body, &mut subscription.topic_filter)?;

        let mut options : u8 = 0;
        mutable_body = decode_u8(mutable_body, &mut options)?;
        if (options & SUBSCRIPTION_OPTIONS_RESERVED_BITS_MASK) != 0 {
            let message = "decode_subscribe_packet - reserved bits set in requested qos";
            error!("{}", message);
            return Err(SchistError::new_malformed_packet(message));
        }

        subscription.qos = QualityOfService::try_from(options)?;
        packet.subscriptions.push(subscription);
    }

    if packet.subscriptions.is_empty() {
        let message = "decode_subscribe_packet - no subscriptions";
        error!("{}", message);
        return Err(SchistError::new_malformed_packet(message));
    }

    Ok(Box::new(MqttPacket::Subscribe(packet)))
}

pub(crate) fn validate_subscribe_packet_outbound(packet: &SubscribePacket) -> SchistResult<()> {

    if packet.packet_id != 0 {
        error!("SubscribePacket Outbound Validation - packet id may not be set");
        return Err(SchistError::new_subscribe_validation("packet id is set"));
    }

    if packet.subscriptions.is_empty() {
        error!("SubscribePacket Outbound Validation - empty subscription set");
        return Err(SchistError::new_subscribe_validation("subscription set is empty"));
    }

    for subscription in &packet.subscriptions {
        if !is_valid_topic_filter(&subscription.topic_filter) {
            error!("SubscribePacket Outbound Validation - invalid topic filter \"{}\"", subscription.topic_filter);
            return Err(SchistError::new_subscribe_validation("invalid topic filter"));
        }
    }

    if compute_subscribe_packet_remaining_length(packet).is_err() {
        error!("SubscribePacket Outbound Validation - packet length exceeds the protocol maximum");
        return Err(SchistError::new_subscribe_validation("packet length exceeds the protocol maximum"));
    }

    Ok(())
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ topic_filter:\"{}\" qos:{} }}", self.topic_filter, self.qos)
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut fields = PacketFields::begin(f, "SubscribePacket")?;
        fields.value("packet_id", self.packet_id)?;
        fields.list("subscriptions", &self.subscriptions, |f, subscription| write!(f, "{}", subscription))?;
        fields.finish()
    }
}
