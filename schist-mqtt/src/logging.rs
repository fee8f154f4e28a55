/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::mqtt::*;
use crate::mqtt::utils::mqtt_packet_to_str;
use log::*;
use std::fmt;

/// Writes `Name { field:value ... }` style Display output
pub(crate) struct PacketFields<'a, 'b> {
    formatter: &'a mut fmt::Formatter<'b>,
}

impl<'a, 'b> PacketFields<'a, 'b> {
    pub(crate) fn begin(formatter: &'a mut fmt::Formatter<'b>, name: &str) -> Result<Self, fmt::Error> {
        write!(formatter, "{} {{", name)?;
        Ok(PacketFields { formatter })
    }

    pub(crate) fn value(&mut self, field: &str, value: impl fmt::Display) -> fmt::Result {
        write!(self.formatter, " {}:{}", field, value)
    }

    pub(crate) fn string(&mut self, field: &str, value: &str) -> fmt::Result {
        write!(self.formatter, " {}:\"{}\"", field, value)
    }

    pub(crate) fn optional_string(&mut self, field: &str, value: Option<&str>) -> fmt::Result {
        match value {
            Some(value) => { self.string(field, value) }
            None => { Ok(()) }
        }
    }

    /// Binary data is only ever rendered as its length
    pub(crate) fn optional_bytes(&mut self, field: &str, value: Option<&[u8]>) -> fmt::Result {
        match value {
            Some(bytes) => { write!(self.formatter, " {}:<{} Bytes>", field, bytes.len()) }
            None => { Ok(()) }
        }
    }

    pub(crate) fn redacted(&mut self, field: &str, present: bool) -> fmt::Result {
        if present {
            write!(self.formatter, " {}:<...redacted>", field)?;
        }

        Ok(())
    }

    /// Writes `field: [ 0:item 1:item ... ]`
    pub(crate) fn list<T>(&mut self, field: &str, items: &[T], render: impl Fn(&mut fmt::Formatter<'b>, &T) -> fmt::Result) -> fmt::Result {
        write!(self.formatter, " {}: [", field)?;
        for (index, item) in items.iter().enumerate() {
            write!(self.formatter, " {}:", index)?;
            render(self.formatter, item)?;
        }
        write!(self.formatter, " ]")
    }

    pub(crate) fn open_group(&mut self, field: &str) -> fmt::Result {
        write!(self.formatter, " {}:{{", field)
    }

    pub(crate) fn close_group(&mut self) -> fmt::Result {
        write!(self.formatter, " }}")
    }

    pub(crate) fn finish(self) -> fmt::Result {
        write!(self.formatter, " }}")
    }
}

macro_rules! define_ack_packet_display_trait {
    ($packet_type: ident, $packet_name: expr) => {
        impl fmt::Display for $packet_type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut fields = PacketFields::begin(f, $packet_name)?;
                fields.value("packet_id", self.packet_id)?;
                fields.finish()
            }
        }
    };
}

pub(crate) use define_ack_packet_display_trait;

macro_rules! define_empty_packet_display_trait {
    ($packet_type: ident, $packet_name: expr) => {
        impl fmt::Display for $packet_type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} {{}}", $packet_name)
            }
        }
    };
}

pub(crate) use define_empty_packet_display_trait;

impl fmt::Display for MqttPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MqttPacket::Connect(packet) => { packet.fmt(f) }
            MqttPacket::Connack(packet) => { packet.fmt(f) }
            MqttPacket::Publish(packet) => { packet.fmt(f) }
            MqttPacket::Puback(packet) => { packet.fmt(f) }
            MqttPacket::Pubrec(packet) => { packet.fmt(f) }
            MqttPacket::Pubrel(packet) => { packet.fmt(f) }
            MqttPacket::Pubcomp(packet) => { packet.fmt(f) }
            MqttPacket::Subscribe(packet) => { packet.fmt(f) }
            MqttPacket::Suback(packet) => { packet.fmt(f) }
            MqttPacket::Unsubscribe(packet) => { packet.fmt(f) }
            MqttPacket::Unsuback(packet) => { packet.fmt(f) }
            MqttPacket::Pingreq(packet) => { packet.fmt(f) }
            MqttPacket::Pingresp(packet) => { packet.fmt(f) }
            MqttPacket::Disconnect(packet) => { packet.fmt(f) }
        }
    }
}

/// Info logs the packet type only; Debug and Trace log every field
pub(crate) fn log_packet(prefix: &str, packet: &MqttPacket) {
    if log_enabled!(Level::Debug) {
        debug!("{}{}", prefix, packet);
    } else {
        info!("{}{}", prefix, mqtt_packet_to_str(packet));
    }
}
