/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

pub(crate) mod utils;

use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;
use crate::mqtt::connect::*;
use crate::mqtt::publish::*;
use crate::mqtt::subscribe::*;
use crate::mqtt::unsubscribe::*;

use log::*;

pub(crate) const MAXIMUM_STRING_PROPERTY_LENGTH : usize = 65535;
pub(crate) const MAXIMUM_BINARY_PROPERTY_LENGTH : usize = 65535;

/// Validates client-outbound packets against the MQTT 3.1.1 spec requirements.
///
/// This function is called synchronously on submitted packets before even crossing
/// the async boundary into the client implementation, so a failure here guarantees that
/// nothing was written to the network.
pub(crate) fn validate_packet_outbound(packet: &MqttPacket) -> SchistResult<()> {
    match packet {
        MqttPacket::Connect(connect) => { validate_connect_packet_outbound(connect) }
        MqttPacket::Publish(publish) => { validate_publish_packet_outbound(publish) }
        MqttPacket::Subscribe(subscribe) => { validate_subscribe_packet_outbound(subscribe) }
        MqttPacket::Unsubscribe(unsubscribe) => { validate_unsubscribe_packet_outbound(unsubscribe) }
        MqttPacket::Disconnect(_) => { Ok(()) }
        _ => {
            error!("Packet Outbound Validation - unexpected packet type");
            Err(SchistError::new_protocol_error("unexpected outbound packet type"))
        }
    }
}
