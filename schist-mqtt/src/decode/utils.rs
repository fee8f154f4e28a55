/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{SchistError, SchistResult};

use log::*;

#[derive(Eq, PartialEq, Debug)]
pub(crate) enum DecodeVliResult<'a> {
    InsufficientData,
    Value(u32, &'a[u8]), /* (decoded value, remaining bytes) */
}

pub(crate) fn decode_vli(buffer: &[u8]) -> SchistResult<DecodeVliResult> {
    let mut value: u32 = 0;
    let mut needs_data: bool;
    let mut shift: u32 = 0;
    let data_len = buffer.len();

    for i in 0..4 {
        if i >= data_len {
            return Ok(DecodeVliResult::InsufficientData);
        }

        let byte = buffer[i];
        value |= ((byte & 0x7F) as u32) << shift;
        shift += 7;

        needs_data = (byte & 0x80) != 0;
        if !needs_data {
            return Ok(DecodeVliResult::Value(value, &buffer[(i + 1)..]));
        }
    }

    error!("Packet Decode - invalid variable length integer");
    Err(SchistError::new_malformed_packet("invalid variable length integer"))
}

fn read_u16_prefix(bytes: &[u8]) -> usize {
    u16::from_be_bytes([bytes[0], bytes[1]]) as usize
}

fn map_utf8_err_to_malformed_packet(err: std::str::Utf8Error) -> SchistError {
    error!("Packet Decode - invalid utf-8");
    SchistError::new_malformed_packet(err)
}

pub(crate) fn decode_length_prefixed_string<'a>(bytes: &'a[u8], value: &mut String) -> SchistResult<&'a[u8]> {
    if bytes.len() < 2 {
        error!("Packet Decode - Utf-8 string value does not have a full length prefix");
        return Err(SchistError::new_malformed_packet("string value does not have a full length prefix"));
    }

    let value_length = read_u16_prefix(bytes);
    let mutable_bytes = &bytes[2..];
    if value_length > mutable_bytes.len() {
        error!("Packet Decode - Utf-8 string value has length larger than remaining packet bytes");
        return Err(SchistError::new_malformed_packet("string value has length larger than remaining packet bytes"));
    }

    let decode_utf8_result = std::str::from_utf8(&mutable_bytes[..value_length]).map_err(map_utf8_err_to_malformed_packet)?;
    *value = decode_utf8_result.to_string();
    Ok(&mutable_bytes[(value_length)..])
}

pub(crate) fn decode_length_prefixed_optional_string<'a>(bytes: &'a[u8], value: &mut Option<String>) -> SchistResult<&'a[u8]> {
    let mut decoded = String::new();
    let remaining_bytes = decode_length_prefixed_string(bytes, &mut decoded)?;

    if decoded.is_empty() {
        *value = None;
    } else {
        *value = Some(decoded);
    }

    Ok(remaining_bytes)
}

pub(crate) fn decode_length_prefixed_bytes<'a>(bytes: &'a[u8], value: &mut Vec<u8>) -> SchistResult<&'a[u8]> {
    if bytes.len() < 2 {
        error!("Packet Decode - Binary data value does not have a full length prefix");
        return Err(SchistError::new_malformed_packet("binary value does not have a full length prefix"));
    }

    let value_length = read_u16_prefix(bytes);
    let mutable_bytes = &bytes[2..];
    if value_length > mutable_bytes.len() {
        error!("Packet Decode - Binary data value has length larger than remaining packet bytes");
        return Err(SchistError::new_malformed_packet("binary value has length larger than remaining packet bytes"));
    }

    *value = Vec::from(&mutable_bytes[..value_length]);
    Ok(&mutable_bytes[(value_length)..])
}

pub(crate) fn decode_u8<'a>(bytes: &'a[u8], value: &mut u8) -> SchistResult<&'a[u8]> {
    if bytes.is_empty() {
        error!("Packet Decode - Insufficent packet bytes for u8 property");
        return Err(SchistError::new_malformed_packet("insufficient packet bytes for u8 field"));
    }

    *value = bytes[0];

    Ok(&bytes[1..])
}

pub(crate) fn decode_u8_as_enum<'a, T>(bytes: &'a[u8], value: &mut T, converter: fn(u8) -> SchistResult<T>) -> SchistResult<&'a[u8]> {
    if bytes.is_empty() {
        error!("Packet Decode - Insufficent packet bytes for enum property");
        return Err(SchistError::new_malformed_packet("insufficient packet bytes for enum field"));
    }

    *value = converter(bytes[0])?;

    Ok(&bytes[1..])
}

pub(crate) fn decode_u16<'a>(bytes: &'a[u8], value: &mut u16) -> SchistResult<&'a[u8]> {
    if bytes.len() < 2 {
        error!("Packet Decode - Insufficent packet bytes for u16 property");
        return Err(SchistError::new_malformed_packet("insufficient packet bytes for u16 field"));
    }

    *value = u16::from_be_bytes([bytes[0], bytes[1]]);

    Ok(&bytes[2..])
}

macro_rules! define_ack_packet_decode_function {
    ($function_name: ident, $mqtt_packet_type:ident, $packet_type: ident, $packet_type_as_string: expr, $first_byte: expr) => {
        pub(crate) fn $function_name(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {

            if first_byte != $first_byte {
                let message = format!("{} - invalid first byte", $packet_type_as_string);
                error!("{}", message);
                return Err(SchistError::new_malformed_packet(message));
            }

            if packet_body.len() != 2 {
                let message = format!("{} - invalid packet body length", $packet_type_as_string);
                error!("{}", message);
                return Err(SchistError::new_malformed_packet(message));
            }

            let mut packet = $packet_type { ..Default::default() };
            decode_u16(packet_body, &mut packet.packet_id)?;

            if packet.packet_id == 0 {
                let message = format!("{} - packet id may not be zero", $packet_type_as_string);
                error!("{}", message);
                return Err(SchistError::new_malformed_packet(message));
            }

            Ok(Box::new(MqttPacket::$mqtt_packet_type(packet)))
        }
    };
}

pub(crate) use define_ack_packet_decode_function;

macro_rules! define_empty_packet_decode_function {
    ($function_name: ident, $mqtt_packet_type:ident, $packet_type: ident, $packet_type_as_string: expr, $first_byte: expr) => {
        pub(crate) fn $function_name(first_byte: u8, packet_body: &[u8]) -> SchistResult<Box<MqttPacket>> {
            if first_byte != $first_byte {
                let message = format!("{} - invalid first byte", $packet_type_as_string);
                error!("{}", message);
                return Err(SchistError::new_malformed_packet(message));
            }

            if !packet_body.is_empty() {
                let message = format!("{} - non-empty packet body", $packet_type_as_string);
                error!("{}", message);
                return Err(SchistError::new_malformed_packet(message));
            }

            Ok(Box::new(MqttPacket::$mqtt_packet_type($packet_type{})))
        }
    };
}

pub(crate) use define_empty_packet_decode_function;
