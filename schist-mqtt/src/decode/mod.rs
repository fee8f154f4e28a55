/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

pub(crate) mod utils;

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{SchistError, SchistResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;
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

use log::*;

use std::collections::VecDeque;

const DECODE_BUFFER_DEFAULT_SIZE : usize = 16 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DecoderState {
    AwaitingFixedHeader,
    AwaitingRemainingLength { first_byte: u8 },
    AwaitingBody { first_byte: u8, remaining_length: usize },
    Failed,
}

pub(crate) struct DecodingContext<'a> {

    /// Largest acceptable packet, fixed header included; zero means the protocol maximum
    pub(crate) maximum_packet_size : u32,

    pub(crate) decoded_packets: &'a mut VecDeque<Box<MqttPacket>>
}

/// Incremental packet decoder.  Accepts arbitrary fragments of the inbound byte stream and
/// emits every packet completed by them.  The first malformed packet is terminal for the
/// lifetime of the connection.
pub(crate) struct Decoder {
    state: DecoderState,

    remaining_length_bytes: Vec<u8>,

    body: Vec<u8>,
}

fn decode_packet(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {
    let packet_type = first_byte >> 4;

    debug!("Decoding a packet of type {}", packet_type_to_str(packet_type));

    match packet_type {
        PACKET_TYPE_CONNECT => { decode_connect_packet(first_byte, packet_body) }
        PACKET_TYPE_CONNACK => { decode_connack_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBLISH => { decode_publish_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBACK => { decode_puback_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBREC => { decode_pubrec_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBREL => { decode_pubrel_packet(first_byte, packet_body) }
        PACKET_TYPE_PUBCOMP => { decode_pubcomp_packet(first_byte, packet_body) }
        PACKET_TYPE_SUBSCRIBE => { decode_subscribe_packet(first_byte, packet_body) }
        PACKET_TYPE_SUBACK => { decode_suback_packet(first_byte, packet_body) }
        PACKET_TYPE_UNSUBSCRIBE => { decode_unsubscribe_packet(first_byte, packet_body) }
        PACKET_TYPE_UNSUBACK => { decode_unsuback_packet(first_byte, packet_body) }
        PACKET_TYPE_PINGREQ => { decode_pingreq_packet(first_byte, packet_body) }
        PACKET_TYPE_PINGRESP => { decode_pingresp_packet(first_byte, packet_body) }
        PACKET_TYPE_DISCONNECT => { decode_disconnect_packet(first_byte, packet_body) }
        _ => {
            error!("Packet Decode - invalid packet type: {}", packet_type);
            Err(SchistError::new_malformed_packet("invalid packet type"))
        }
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            state: DecoderState::AwaitingFixedHeader,
            remaining_length_bytes: Vec::with_capacity(4),
            body: Vec::with_capacity(DECODE_BUFFER_DEFAULT_SIZE),
        }
    }

    /// Clears partial packet state, including a terminal failure from the previous connection
    pub fn reset_for_new_connection(&mut self) {
        self.state = DecoderState::AwaitingFixedHeader;
        self.remaining_length_bytes.clear();
        self.body.clear();
    }

    pub fn decode_bytes(&mut self, bytes: &[u8], context: &mut DecodingContext) -> SchistResult<()> {
        let mut unread = bytes;

        loop {
            let step_result =
                match self.state {
                    DecoderState::AwaitingFixedHeader => { Ok(self.read_first_byte(unread)) }
                    DecoderState::AwaitingRemainingLength { first_byte } => {
                        self.read_remaining_length(first_byte, unread, context.maximum_packet_size)
                    }
                    DecoderState::AwaitingBody { first_byte, remaining_length } => {
                        self.read_body(first_byte, remaining_length, unread, context)
                    }
                    DecoderState::Failed => {
                        return Err(SchistError::new_malformed_packet("decoder previously encountered a malformed packet"));
                    }
                };

            match step_result {
                Ok(Some(rest)) => { unread = rest; }
                Ok(None) => { return Ok(()); }
                Err(error) => {
                    self.state = DecoderState::Failed;
                    return Err(error);
                }
            }
        }
    }

    // Each reader returns the unconsumed input once it advances the state, or None when the
    // input ran out first

    fn read_first_byte<'a>(&mut self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        let (first_byte, rest) = bytes.split_first()?;

        self.remaining_length_bytes.clear();
        self.state = DecoderState::AwaitingRemainingLength { first_byte: *first_byte };

        Some(rest)
    }

    fn read_remaining_length<'a>(&mut self, first_byte: u8, bytes: &'a [u8], maximum_packet_size: u32) -> SchistResult<Option<&'a [u8]>> {
        let Some((next_byte, rest)) = bytes.split_first() else {
            return Ok(None);
        };

        self.remaining_length_bytes.push(*next_byte);

        let DecodeVliResult::Value(remaining_length, _) = decode_vli(&self.remaining_length_bytes)? else {
            return Ok(Some(rest));
        };

        let maximum_packet_size =
            if maximum_packet_size == 0 {
                MAXIMUM_VARIABLE_LENGTH_INTEGER as u64
            } else {
                maximum_packet_size as u64
            };

        let packet_size = 1 + self.remaining_length_bytes.len() as u64 + remaining_length as u64;
        if packet_size > maximum_packet_size {
            error!("Packet Decode - packet size {} exceeds maximum of {}", packet_size, maximum_packet_size);
            return Err(SchistError::new_malformed_packet("inbound packet exceeds the maximum packet size"));
        }

        self.body.clear();
        self.state = DecoderState::AwaitingBody { first_byte, remaining_length: remaining_length as usize };

        Ok(Some(rest))
    }

    fn read_body<'a>(&mut self, first_byte: u8, remaining_length: usize, bytes: &'a [u8], context: &mut DecodingContext) -> SchistResult<Option<&'a [u8]>> {
        let missing = remaining_length - self.body.len();
        if bytes.len() < missing {
            self.body.extend_from_slice(bytes);
            return Ok(None);
        }

        let (tail, rest) = bytes.split_at(missing);

        // whole packet in one fragment: skip the copy
        let packet =
            if self.body.is_empty() {
                decode_packet(first_byte, tail)?
            } else {
                self.body.extend_from_slice(tail);
                decode_packet(first_byte, &self.body)?
            };

        log_packet("Successfully decoded incoming packet: ", &packet);
        context.decoded_packets.push_back(packet);

        self.body.clear();
        self.state = DecoderState::AwaitingFixedHeader;

        Ok(Some(rest))
    }
}
