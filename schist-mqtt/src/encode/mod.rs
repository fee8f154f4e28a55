/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

pub(crate) mod utils;

use crate::encode::utils::*;
use crate::error::{SchistError, SchistResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::connack::*;
use crate::mqtt::connect::*;
use crate::mqtt::disconnect::*;
use crate::mqtt::pingreq::*;
use crate::mqtt::pingresp::*;
use crate::mqtt::puback::*;
use crate::mqtt::pubcomp::*;
use crate::mqtt::publish::*;
use crate::mqtt::pubrec::*;
use crate::mqtt::pubrel::*;
use crate::mqtt::suback::*;
use crate::mqtt::subscribe::*;
use crate::mqtt::unsuback::*;
use crate::mqtt::unsubscribe::*;

use std::collections::VecDeque;

// Every encoding step writes at most this many bytes before re-checking for room
const MAXIMUM_ATOMIC_STEP_SIZE : usize = 4;

fn write_encoding_steps(mqtt_packet: &MqttPacket, steps: &mut VecDeque<EncodingStep>) -> SchistResult<()> {
    log_packet("Preparing to encode packet: ", mqtt_packet);

    match mqtt_packet {
        MqttPacket::Connect(packet) => { write_connect_encoding_steps(packet, steps) }
        MqttPacket::Connack(packet) => { write_connack_encoding_steps(packet, steps) }
        MqttPacket::Publish(packet) => { write_publish_encoding_steps(packet, steps) }
        MqttPacket::Puback(packet) => { write_puback_encoding_steps(packet, steps) }
        MqttPacket::Pubrec(packet) => { write_pubrec_encoding_steps(packet, steps) }
        MqttPacket::Pubrel(packet) => { write_pubrel_encoding_steps(packet, steps) }
        MqttPacket::Pubcomp(packet) => { write_pubcomp_encoding_steps(packet, steps) }
        MqttPacket::Subscribe(packet) => { write_subscribe_encoding_steps(packet, steps) }
        MqttPacket::Suback(packet) => { write_suback_encoding_steps(packet, steps) }
        MqttPacket::Unsubscribe(packet) => { write_unsubscribe_encoding_steps(packet, steps) }
        MqttPacket::Unsuback(packet) => { write_unsuback_encoding_steps(packet, steps) }
        MqttPacket::Pingreq(packet) => { write_pingreq_encoding_steps(packet, steps) }
        MqttPacket::Pingresp(packet) => { write_pingresp_encoding_steps(packet, steps) }
        MqttPacket::Disconnect(packet) => { write_disconnect_encoding_steps(packet, steps) }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum EncodeResult {
    Complete,
    Full,
}

/// Incremental packet encoder.  A packet is prepared with `reset` and then written in as many
/// `encode` calls as it takes to fit it into the destination buffer's spare capacity.  The
/// destination is never grown.
pub(crate) struct Encoder {
    steps: VecDeque<EncodingStep>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            steps: VecDeque::new(),
        }
    }

    pub fn reset(&mut self, packet: &MqttPacket) -> SchistResult<()> {
        self.steps.clear();

        write_encoding_steps(packet, &mut self.steps)
    }

    pub fn encode(&mut self, packet: &MqttPacket, dest: &mut Vec<u8>) -> SchistResult<EncodeResult> {
        let capacity = dest.capacity();
        if capacity < MAXIMUM_ATOMIC_STEP_SIZE {
            return Err(SchistError::new_encoding_failure("encode target buffer too small"));
        }

        while capacity - dest.len() >= MAXIMUM_ATOMIC_STEP_SIZE {
            let Some(step) = self.steps.pop_front() else {
                break;
            };

            process_encoding_step(&mut self.steps, step, packet, dest)?;
        }

        if capacity != dest.capacity() {
            return Err(SchistError::new_internal_state_error("encoding logic resized dest buffer"));
        }

        if self.steps.is_empty() {
            Ok(EncodeResult::Complete)
        } else {
            Ok(EncodeResult::Full)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::*;
    use assert_matches::assert_matches;

    #[test]
    fn encode_rejects_tiny_buffers() {
        let packet = MqttPacket::Pingreq(PingreqPacket{});
        let mut encoder = Encoder::new();
        assert!(encoder.reset(&packet).is_ok());

        let mut dest = Vec::with_capacity(2);
        assert_matches!(encoder.encode(&packet, &mut dest), Err(SchistError::EncodingFailure(_)));
    }

    #[test]
    fn encode_large_payload_in_pieces() {
        let payload : Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let packet = MqttPacket::Publish(PublishPacket {
            packet_id: 7,
            topic: "large/payload".to_string(),
            qos: QualityOfService::AtLeastOnce,
            payload: Some(payload),
            ..Default::default()
        });

        let mut encoder = Encoder::new();
        assert!(encoder.reset(&packet).is_ok());

        let mut stream = Vec::new();
        let mut buffer = Vec::with_capacity(1024);
        let mut passes = 0;
        loop {
            buffer.clear();
            let result = encoder.encode(&packet, &mut buffer).unwrap();
            stream.extend_from_slice(buffer.as_slice());
            passes += 1;
            if result == EncodeResult::Complete {
                break;
            }
        }

        assert!(passes > 1);
        assert_eq!(encode_packet_for_test(&packet), stream);
    }

    #[test]
    fn encode_rejects_unbound_packet_ids() {
        let packets = vec!(
            MqttPacket::Puback(PubackPacket { packet_id: 0 }),
            MqttPacket::Pubrec(PubrecPacket { packet_id: 0 }),
            MqttPacket::Pubrel(PubrelPacket { packet_id: 0 }),
            MqttPacket::Pubcomp(PubcompPacket { packet_id: 0 }),
            MqttPacket::Unsuback(UnsubackPacket { packet_id: 0 }),
            MqttPacket::Suback(SubackPacket { packet_id: 0, return_codes: vec!(SubackReturnCode::GrantedQos1) }),
            MqttPacket::Subscribe(SubscribePacket::builder().with_subscription_simple("a/+", QualityOfService::AtLeastOnce).build()),
            MqttPacket::Unsubscribe(UnsubscribePacket::builder().with_topic_filter("a/+").build()),
        );

        let mut encoder = Encoder::new();
        for packet in &packets {
            assert_matches!(encoder.reset(packet), Err(SchistError::EncodingFailure(_)));
        }
    }
}
