/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Fixed header constants and packet naming helpers.
 */

use crate::mqtt::*;

pub(crate) const PACKET_TYPE_CONNECT: u8 = PacketType::Connect as u8;
pub(crate) const PACKET_TYPE_CONNACK: u8 = PacketType::Connack as u8;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = PacketType::Publish as u8;
pub(crate) const PACKET_TYPE_PUBACK: u8 = PacketType::Puback as u8;
pub(crate) const PACKET_TYPE_PUBREC: u8 = PacketType::Pubrec as u8;
pub(crate) const PACKET_TYPE_PUBREL: u8 = PacketType::Pubrel as u8;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = PacketType::Pubcomp as u8;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = PacketType::Subscribe as u8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = PacketType::Suback as u8;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = PacketType::Unsubscribe as u8;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = PacketType::Unsuback as u8;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = PacketType::Pingreq as u8;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = PacketType::Pingresp as u8;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = PacketType::Disconnect as u8;

pub(crate) const PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG : u8 = 8;
pub(crate) const PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG : u8 = 1;
pub(crate) const QOS_MASK : u8 = 3;

pub(crate) const CONNECT_PACKET_RESERVED_FLAG_MASK : u8 = 1;
pub(crate) const CONNECT_PACKET_CLEAN_START_FLAG_MASK : u8 = 1 << 1;
pub(crate) const CONNECT_PACKET_HAS_WILL_FLAG_MASK : u8 = 1 << 2;
pub(crate) const CONNECT_PACKET_WILL_QOS_FLAG_SHIFT : u8 = 3;
pub(crate) const CONNECT_PACKET_WILL_RETAIN_FLAG_MASK : u8 = 1 << 5;
pub(crate) const CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK : u8 = 1 << 6;
pub(crate) const CONNECT_PACKET_HAS_USERNAME_FLAG_MASK : u8 = 1 << 7;

pub(crate) const CONNECT_FIRST_BYTE : u8 = PACKET_TYPE_CONNECT << 4;
pub(crate) const CONNACK_FIRST_BYTE : u8 = PACKET_TYPE_CONNACK << 4;
pub(crate) const UNSUBSCRIBE_FIRST_BYTE : u8 = (PACKET_TYPE_UNSUBSCRIBE << 4) | (0x02u8);
pub(crate) const UNSUBACK_FIRST_BYTE : u8 = PACKET_TYPE_UNSUBACK << 4;
pub(crate) const SUBSCRIBE_FIRST_BYTE : u8 = (PACKET_TYPE_SUBSCRIBE << 4) | (0x02u8);
pub(crate) const SUBACK_FIRST_BYTE : u8 = PACKET_TYPE_SUBACK << 4;
pub(crate) const PUBREL_FIRST_BYTE : u8 = (PACKET_TYPE_PUBREL << 4) | (0x02u8);
pub(crate) const PUBACK_FIRST_BYTE : u8 = PACKET_TYPE_PUBACK << 4;
pub(crate) const PUBREC_FIRST_BYTE : u8 = PACKET_TYPE_PUBREC << 4;
pub(crate) const PUBCOMP_FIRST_BYTE : u8 = PACKET_TYPE_PUBCOMP << 4;
pub(crate) const PINGREQ_FIRST_BYTE : u8 = PACKET_TYPE_PINGREQ << 4;
pub(crate) const PINGRESP_FIRST_BYTE : u8 = PACKET_TYPE_PINGRESP << 4;
pub(crate) const DISCONNECT_FIRST_BYTE : u8 = PACKET_TYPE_DISCONNECT << 4;

/// Control packet name for a fixed header packet type code
pub(crate) fn packet_type_to_str(packet_type: u8) -> &'static str {
    PacketType::from_code(packet_type).map_or("UNKNOWN", PacketType::protocol_name)
}

pub(crate) fn mqtt_packet_to_str(packet: &MqttPacket) -> &'static str {
    packet.packet_type().protocol_name()
}
