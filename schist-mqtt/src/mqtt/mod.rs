/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model the MQTT 3.1.1 specification.
 */

use crate::error::{SchistError, SchistResult};

use log::*;
use std::fmt;

pub(crate) mod connack;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod pingreq;
pub(crate) mod pingresp;
pub(crate) mod puback;
pub(crate) mod pubcomp;
pub(crate) mod publish;
pub(crate) mod pubrec;
pub(crate) mod pubrel;
pub(crate) mod suback;
pub(crate) mod subscribe;
pub(crate) mod unsuback;
pub(crate) mod unsubscribe;
pub(crate) mod utils;

/// MQTT message delivery quality of service.
///
/// Enum values match [MQTT311 spec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718099) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No response is sent by the
    /// receiver and no retry is performed by the sender. The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = SchistError;

    fn try_from(value: u8) -> SchistResult<Self> {
        match value {
            0 => { Ok(QualityOfService::AtMostOnce) }
            1 => { Ok(QualityOfService::AtLeastOnce) }
            2 => { Ok(QualityOfService::ExactlyOnce) }
            _ => {
                error!("Packet Decode - {} is not a quality of service", value);
                Err(SchistError::new_malformed_packet("invalid quality of service value"))
            }
        }
    }
}

/// Server return code for connect attempts.
///
/// Enum values match [MQTT311 spec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718035) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReturnCode {

    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The server does not support the level of the MQTT protocol requested by the client.
    UnacceptableProtocolVersion = 1,

    /// The client identifier is correct UTF-8 but not allowed by the server.
    IdentifierRejected = 2,

    /// The network connection has been made but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed.
    BadUsernameOrPassword = 4,

    /// The client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {

    /// Returns whether or not the return code represents a successful connection
    pub fn is_success(&self) -> bool {
        *self == ConnectReturnCode::Accepted
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = SchistError;

    fn try_from(value: u8) -> SchistResult<Self> {
        match value {
            0 => { Ok(ConnectReturnCode::Accepted) }
            1 => { Ok(ConnectReturnCode::UnacceptableProtocolVersion) }
            2 => { Ok(ConnectReturnCode::IdentifierRejected) }
            3 => { Ok(ConnectReturnCode::ServerUnavailable) }
            4 => { Ok(ConnectReturnCode::BadUsernameOrPassword) }
            5 => { Ok(ConnectReturnCode::NotAuthorized) }
            _ => {
                error!("Packet Decode - {} is not a CONNACK return code", value);
                Err(SchistError::new_malformed_packet("invalid connect return code value"))
            }
        }
    }
}

/// Server return code for each topic filter of a subscribe request.
///
/// Enum values match [MQTT311 spec](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718071) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReturnCode {

    /// The subscription was accepted and the maximum QoS sent will be QoS 0.
    #[default]
    GrantedQos0 = 0,

    /// The subscription was accepted and the maximum QoS sent will be QoS 1.
    GrantedQos1 = 1,

    /// The subscription was accepted and the maximum QoS sent will be QoS 2.
    GrantedQos2 = 2,

    /// The subscription was rejected by the server.
    Failure = 128,
}

impl SubackReturnCode {

    /// Returns whether or not the return code represents a successful subscription
    pub fn is_success(&self) -> bool {
        *self != SubackReturnCode::Failure
    }
}

impl TryFrom<u8> for SubackReturnCode {
    type Error = SchistError;

    fn try_from(value: u8) -> SchistResult<Self> {
        match value {
            0 => { Ok(SubackReturnCode::GrantedQos0) }
            1 => { Ok(SubackReturnCode::GrantedQos1) }
            2 => { Ok(SubackReturnCode::GrantedQos2) }
            0x80 => { Ok(SubackReturnCode::Failure) }
            _ => {
                error!("Packet Decode - {} is not a SUBACK return code", value);
                Err(SchistError::new_malformed_packet("invalid suback return code value"))
            }
        }
    }
}

// Variant names double as the display text
macro_rules! display_as_debug {
    ($($value_type: ty),+) => {
        $(
            impl fmt::Display for $value_type {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Debug::fmt(self, f)
                }
            }
        )+
    };
}

display_as_debug!(QualityOfService, ConnectReturnCode, SubackReturnCode);

/// Specifies a single subscription within a Subscribe operation
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {
    pub(crate) topic_filter: String,
    pub(crate) qos: QualityOfService,
}

impl Subscription {

    /// Creates a new subscription to a topic filter at a maximum quality of service
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos
        }
    }

    /// Topic filter to subscribe to
    pub fn topic_filter(&self) -> &str { self.topic_filter.as_str() }

    /// Maximum QoS on which the subscriber will accept publish messages.
    pub fn qos(&self) -> QualityOfService { self.qos }
}

/// Data model of an [MQTT311 CONNACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718033) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {
    pub(crate) session_present: bool,
    pub(crate) return_code: ConnectReturnCode,
}

impl ConnackPacket {

    /// True if the client rejoined an existing session on the server, false otherwise.
    pub fn session_present(&self) -> bool { self.session_present }

    /// Indicates either success or the reason for failure for the connection attempt.
    pub fn return_code(&self) -> ConnectReturnCode { self.return_code }
}

/// Data model of an [MQTT311 CONNECT](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {
    pub(crate) keep_alive_interval_seconds: u16,
    pub(crate) clean_start: bool,
    pub(crate) client_id: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) will: Option<PublishPacket>,
}

/// Data model of an [MQTT311 DISCONNECT](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718090) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {}

/// Data model of an [MQTT311 PINGREQ](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718081) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

/// Data model of an [MQTT311 PINGRESP](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718086) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingrespPacket {}

/// Data model of an [MQTT311 PUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718043) packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {
    pub(crate) packet_id: u16,
}

impl PubackPacket {

    /// Id of the QoS 1 publish this packet is acknowledging
    pub fn packet_id(&self) -> u16 { self.packet_id }
}

/// Data model of an [MQTT311 PUBREC](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718048) packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {
    pub(crate) packet_id: u16,
}

impl PubrecPacket {

    /// Id of the QoS 2 publish this packet is acknowledging
    pub fn packet_id(&self) -> u16 { self.packet_id }
}

/// Data model of an [MQTT311 PUBREL](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718053) packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {
    pub(crate) packet_id: u16,
}

impl PubrelPacket {

    /// Id of the QoS 2 publish this packet corresponds to
    pub fn packet_id(&self) -> u16 { self.packet_id }
}

/// Data model of an [MQTT311 PUBCOMP](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718058) packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {
    pub(crate) packet_id: u16,
}

impl PubcompPacket {

    /// Id of the QoS 2 publish this packet corresponds to
    pub fn packet_id(&self) -> u16 { self.packet_id }
}

/// Data model of an [MQTT311 PUBLISH](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718037) packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {
    pub(crate) packet_id: u16,
    pub(crate) topic: String,
    pub(crate) qos: QualityOfService,
    pub(crate) duplicate: bool,
    pub(crate) retain: bool,
    pub(crate) payload: Option<Vec<u8>>,
}

impl PublishPacket {

    /// Creates a new builder for a PublishPacket.
    pub fn builder(topic: String, qos: QualityOfService) -> PublishPacketBuilder {
        PublishPacketBuilder::new(topic, qos)
    }

    /// Packet id of the publish.  Zero for QoS 0 publishes and for outbound publishes that
    /// have not yet been assigned an id.
    pub fn packet_id(&self) -> u16 { self.packet_id }

    /// Sent publishes - The topic this message should be published to.
    ///
    /// Received publishes - The topic this message was published to.
    pub fn topic(&self) -> &str { self.topic.as_str() }

    /// The MQTT quality of service associated with this PUBLISH packet.
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// True if this packet is a retransmission of an earlier delivery attempt.
    pub fn duplicate(&self) -> bool { self.duplicate }

    /// True if this is a retained message, false otherwise.
    pub fn retain(&self) -> bool { self.retain }

    /// The payload of the publish message.
    pub fn payload(&self) -> Option<&[u8]> { self.payload.as_deref() }
}

/// Builder type for PublishPacket instances.
pub struct PublishPacketBuilder {
    packet: PublishPacket
}

impl PublishPacketBuilder {

    pub(crate) fn new(topic: String, qos: QualityOfService) -> Self {
        PublishPacketBuilder {
            packet: PublishPacket {
                topic,
                qos,
                ..Default::default()
            }
        }
    }

    /// Sets whether or not the broker should retain this message.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.packet.retain = retain;
        self
    }

    /// Sets the message payload.  An empty payload is treated as no payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        if payload.is_empty() {
            self.packet.payload = None;
        } else {
            self.packet.payload = Some(payload);
        }
        self
    }

    /// Builds a new PublishPacket.  Consumes the builder in the process.
    pub fn build(self) -> PublishPacket {
        self.packet
    }
}

/// Data model of an [MQTT311 SUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718068) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {
    pub(crate) packet_id: u16,
    pub(crate) return_codes: Vec<SubackReturnCode>,
}

impl SubackPacket {

    /// Id of the subscribe this packet is acknowledging
    pub fn packet_id(&self) -> u16 { self.packet_id }

    /// A list of return codes indicating the result of each individual subscription entry in the
    /// associated SUBSCRIBE packet.
    pub fn return_codes(&self) -> &[SubackReturnCode] { self.return_codes.as_slice() }
}

/// Data model of an [MQTT311 SUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718063) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {
    pub(crate) packet_id: u16,
    pub(crate) subscriptions: Vec<Subscription>,
}

impl SubscribePacket {

    /// Creates a new builder for a SubscribePacket.
    pub fn builder() -> SubscribePacketBuilder {
        SubscribePacketBuilder::new()
    }

    /// List of topic filter subscriptions that the client wishes to listen to
    pub fn subscriptions(&self) -> &[Subscription] { self.subscriptions.as_slice() }
}

/// Builder type for SubscribePacket instances.
pub struct SubscribePacketBuilder {
    packet: SubscribePacket
}

impl SubscribePacketBuilder {
    pub(crate) fn new() -> Self {
        SubscribePacketBuilder {
            packet: SubscribePacket {
                ..Default::default()
            }
        }
    }

    /// Adds a subscription to the packet.
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.packet.subscriptions.push(subscription);
        self
    }

    /// Adds a subscription to a topic filter at a maximum quality of service.
    pub fn with_subscription_simple(mut self, topic_filter: &str, qos: QualityOfService) -> Self {
        self.packet.subscriptions.push(Subscription::new(topic_filter, qos));
        self
    }

    /// Builds a new SubscribePacket.  Consumes the builder in the process.
    pub fn build(self) -> SubscribePacket {
        self.packet
    }
}

/// Data model of an [MQTT311 UNSUBACK](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718077) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {
    pub(crate) packet_id: u16,
}

impl UnsubackPacket {

    /// Id of the unsubscribe this packet is acknowledging
    pub fn packet_id(&self) -> u16 { self.packet_id }
}

/// Data model of an [MQTT311 UNSUBSCRIBE](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718072) packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {
    pub(crate) packet_id: u16,
    pub(crate) topic_filters: Vec<String>,
}

impl UnsubscribePacket {

    /// Creates a new builder for an UnsubscribePacket.
    pub fn builder() -> UnsubscribePacketBuilder {
        UnsubscribePacketBuilder::new()
    }

    /// List of topic filters that the client wishes to unsubscribe from.
    pub fn topic_filters(&self) -> &[String] { self.topic_filters.as_slice() }
}

/// Builder type for UnsubscribePacket instances.
pub struct UnsubscribePacketBuilder {
    packet: UnsubscribePacket
}

impl UnsubscribePacketBuilder {
    pub(crate) fn new() -> Self {
        UnsubscribePacketBuilder {
            packet: UnsubscribePacket {
                ..Default::default()
            }
        }
    }

    /// Adds a topic filter to the packet.
    pub fn with_topic_filter(mut self, topic_filter: &str) -> Self {
        self.packet.topic_filters.push(topic_filter.to_string());
        self
    }

    /// Builds a new UnsubscribePacket.  Consumes the builder in the process.
    pub fn build(self) -> UnsubscribePacket {
        self.packet
    }
}

/// Algebraic union of all MQTT packet types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(PubackPacket),
    Pubrec(PubrecPacket),
    Pubrel(PubrelPacket),
    Pubcomp(PubcompPacket),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Unsubscribe(UnsubscribePacket),
    Unsuback(UnsubackPacket),
    Pingreq(PingreqPacket),
    Pingresp(PingrespPacket),
    Disconnect(DisconnectPacket),
}

impl MqttPacket {

    /// The kind of packet this is
    pub fn packet_type(&self) -> PacketType {
        match self {
            MqttPacket::Connect(_) => { PacketType::Connect }
            MqttPacket::Connack(_) => { PacketType::Connack }
            MqttPacket::Publish(_) => { PacketType::Publish }
            MqttPacket::Puback(_) => { PacketType::Puback }
            MqttPacket::Pubrec(_) => { PacketType::Pubrec }
            MqttPacket::Pubrel(_) => { PacketType::Pubrel }
            MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
            MqttPacket::Subscribe(_) => { PacketType::Subscribe }
            MqttPacket::Suback(_) => { PacketType::Suback }
            MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
            MqttPacket::Unsuback(_) => { PacketType::Unsuback }
            MqttPacket::Pingreq(_) => { PacketType::Pingreq }
            MqttPacket::Pingresp(_) => { PacketType::Pingresp }
            MqttPacket::Disconnect(_) => { PacketType::Disconnect }
        }
    }
}

/// An enum indicating the kind of MQTT packet.  Discriminants are the packet type codes carried
/// in the upper nibble of the fixed header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {

    /// A Connect packet
    Connect = 1,

    /// A Connack packet
    Connack = 2,

    /// A Publish packet
    Publish = 3,

    /// A Puback packet
    Puback = 4,

    /// A Pubrec packet
    Pubrec = 5,

    /// A Pubrel packet
    Pubrel = 6,

    /// A Pubcomp packet
    Pubcomp = 7,

    /// A Subscribe packet
    Subscribe = 8,

    /// A Suback packet
    Suback = 9,

    /// An Unsubscribe packet
    Unsubscribe = 10,

    /// An Unsuback packet
    Unsuback = 11,

    /// A Pingreq packet
    Pingreq = 12,

    /// A Pingresp packet
    Pingresp = 13,

    /// A Disconnect packet
    Disconnect = 14,
}

impl PacketType {

    const ALL: [PacketType; 14] = [
        PacketType::Connect, PacketType::Connack, PacketType::Publish, PacketType::Puback,
        PacketType::Pubrec, PacketType::Pubrel, PacketType::Pubcomp, PacketType::Subscribe,
        PacketType::Suback, PacketType::Unsubscribe, PacketType::Unsuback, PacketType::Pingreq,
        PacketType::Pingresp, PacketType::Disconnect,
    ];

    pub(crate) fn from_code(code: u8) -> Option<PacketType> {
        PacketType::ALL.iter().copied().find(|packet_type| *packet_type as u8 == code)
    }

    /// Upper-case control packet name, e.g. "PUBACK"
    pub(crate) fn protocol_name(self) -> &'static str {
        match self {
            PacketType::Connect => { "CONNECT" }
            PacketType::Connack => { "CONNACK" }
            PacketType::Publish => { "PUBLISH" }
            PacketType::Puback => { "PUBACK" }
            PacketType::Pubrec => { "PUBREC" }
            PacketType::Pubrel => { "PUBREL" }
            PacketType::Pubcomp => { "PUBCOMP" }
            PacketType::Subscribe => { "SUBSCRIBE" }
            PacketType::Suback => { "SUBACK" }
            PacketType::Unsubscribe => { "UNSUBSCRIBE" }
            PacketType::Unsuback => { "UNSUBACK" }
            PacketType::Pingreq => { "PINGREQ" }
            PacketType::Pingresp => { "PINGRESP" }
            PacketType::Disconnect => { "DISCONNECT" }
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}Packet", self)
    }
}
