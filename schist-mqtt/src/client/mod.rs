/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the public MQTT client and associated types necessary to invoke operations on it.
 */

pub(crate) mod shared_impl;

use crate::config::*;
use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;
use crate::session::*;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tokio")]
use crate::validate::*;
#[cfg(feature = "tokio")]
use log::*;

/// Additional client options applicable to an MQTT Publish operation
#[derive(Debug, Default, Clone)]
pub struct PublishOptions {
    pub(crate) ack_timeout: Option<Duration>,
}

/// Builder type for the set of additional client options applicable to an MQTT Publish operation
#[derive(Default)]
pub struct PublishOptionsBuilder {
    options: PublishOptions
}

impl PublishOptionsBuilder {

    /// Creates a new builder object
    pub fn new() -> Self {
        PublishOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the amount of time to wait for the final acknowledgement once the publish has been
    /// written to the socket.  Has no effect on QoS 0 publishes.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.options.ack_timeout = Some(timeout);
        self
    }

    /// Creates a new PublishOptions object from what was configured on the builder.
    pub fn build(self) -> PublishOptions {
        self.options
    }
}

/// Result of a successfully completed Publish operation.  The variant depends on the
/// publish's quality of service.
#[derive(Debug, Eq, PartialEq)]
pub enum PublishResponse {

    /// QoS 0 publishes complete once written to the socket
    Qos0,

    /// QoS 1 publishes complete on receipt of the broker's PUBACK
    Qos1(PubackPacket),

    /// QoS 2 publishes complete on receipt of the broker's PUBCOMP
    Qos2(PubcompPacket),
}

impl fmt::Display for PublishResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishResponse::Qos0 => {
                write!(f, "PublishResponse Qos0")
            }
            PublishResponse::Qos1(puback) => {
                write!(f, "PublishResponse Qos1 ( {} )", puback)
            }
            PublishResponse::Qos2(pubcomp) => {
                write!(f, "PublishResponse Qos2 ( {} )", pubcomp)
            }
        }
    }
}

/// Result type for the final outcome of a Publish operation
pub type PublishResult = SchistResult<PublishResponse>;

/// Return type of a Publish operation
pub type PublishResultFuture = dyn Future<Output = PublishResult> + Send;

/// Additional client options applicable to an MQTT Subscribe operation
#[derive(Debug, Default, Clone)]
pub struct SubscribeOptions {
    pub(crate) ack_timeout: Option<Duration>,
}

/// Builder type for the set of additional client options applicable to an MQTT Subscribe operation
#[derive(Default)]
pub struct SubscribeOptionsBuilder {
    options: SubscribeOptions
}

impl SubscribeOptionsBuilder {

    /// Creates a new builder object
    pub fn new() -> Self {
        SubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the amount of time to wait for the SUBACK once the subscribe has been written
    /// to the socket.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.options.ack_timeout = Some(timeout);
        self
    }

    /// Creates a new SubscribeOptions object from what was configured on the builder.
    pub fn build(self) -> SubscribeOptions {
        self.options
    }
}

/// Result type for the final outcome of a Subscribe operation
pub type SubscribeResult = SchistResult<SubackPacket>;

/// Return type of a Subscribe operation
pub type SubscribeResultFuture = dyn Future<Output = SubscribeResult> + Send;

/// Additional client options applicable to an MQTT Unsubscribe operation
#[derive(Debug, Default, Clone)]
pub struct UnsubscribeOptions {
    pub(crate) ack_timeout: Option<Duration>,
}

/// Builder type for the set of additional client options applicable to an MQTT Unsubscribe operation
#[derive(Default)]
pub struct UnsubscribeOptionsBuilder {
    options: UnsubscribeOptions
}

impl UnsubscribeOptionsBuilder {

    /// Creates a new builder object
    pub fn new() -> Self {
        UnsubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the amount of time to wait for the UNSUBACK once the unsubscribe has been written
    /// to the socket.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.options.ack_timeout = Some(timeout);
        self
    }

    /// Creates a new UnsubscribeOptions object from what was configured on the builder.
    pub fn build(self) -> UnsubscribeOptions {
        self.options
    }
}

/// Result type for the final outcome of an Unsubscribe operation
pub type UnsubscribeResult = SchistResult<UnsubackPacket>;

/// Return type of an Unsubscribe operation
pub type UnsubscribeResultFuture = dyn Future<Output = UnsubscribeResult> + Send;

/// Result type for a connect request.  Resolves with the first CONNACK the broker sends
/// or with the error that ended the first connection attempt.
pub type ConnectResult = SchistResult<ConnackPacket>;

/// Return type of a connect request
pub type ConnectResultFuture = dyn Future<Output = ConnectResult> + Send;

/// Externally-visible connection lifecycle state of a client
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {

    /// No connection and no connection attempts in progress
    Disconnected,

    /// A transport connection is being established or the CONNACK has not yet arrived
    Connecting,

    /// The broker accepted the connection
    Connected,

    /// A user-requested DISCONNECT is being flushed to the broker
    Disconnecting,

    /// The connection was lost and the client is waiting out the reconnect backoff
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => { write!(f, "Disconnected") }
            ConnectionState::Connecting => { write!(f, "Connecting") }
            ConnectionState::Connected => { write!(f, "Connected") }
            ConnectionState::Disconnecting => { write!(f, "Disconnecting") }
            ConnectionState::Reconnecting => { write!(f, "Reconnecting") }
        }
    }
}

/// An application message delivered by the broker.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IncomingMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QualityOfService,
    retained: bool,
    duplicate: bool,
}

impl IncomingMessage {

    /// Topic the message was published to
    pub fn topic(&self) -> &str { self.topic.as_str() }

    /// Message payload; empty if the publish carried none
    pub fn payload(&self) -> &[u8] { self.payload.as_slice() }

    /// Quality of service the message was delivered with
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// True if the broker delivered this from its retained message store
    pub fn retained(&self) -> bool { self.retained }

    /// True if the broker flagged this as a possible redelivery
    pub fn duplicate(&self) -> bool { self.duplicate }
}

impl From<PublishPacket> for IncomingMessage {
    fn from(publish: PublishPacket) -> Self {
        IncomingMessage {
            topic: publish.topic,
            payload: publish.payload.unwrap_or_default(),
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.duplicate,
        }
    }
}

impl fmt::Display for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IncomingMessage {{ topic:\"{}\", payload:<{} Bytes>, qos:{}, retained:{}, duplicate:{} }}",
            self.topic, self.payload.len(), self.qos, self.retained, self.duplicate)
    }
}

/// Application callback interface.
///
/// Callbacks run on the client's runtime task, in the order the triggering events occurred.
/// Long-running work should be handed off rather than done inline, since no other client event
/// is processed until a callback returns.
pub trait ClientCallbacks : Send + Sync {

    /// Invoked for every application message delivered to the client.  QoS 2 messages are
    /// delivered exactly once; QoS 1 messages may be delivered again if the broker retransmits.
    fn on_message(&self, _message: &IncomingMessage) {}

    /// Invoked on every change of the client's [`ConnectionState`], along with the error that
    /// caused the transition, if any.
    fn on_connection_state_changed(&self, _state: ConnectionState, _error: Option<&SchistError>) {}
}

struct NullCallbacks {}

impl ClientCallbacks for NullCallbacks {}

/// Configuration options that persist across connections made by a client.
pub struct ClientOptions {
    pub(crate) callbacks: Arc<dyn ClientCallbacks>,
    pub(crate) session_store: Box<dyn SessionStore>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientOptions {{ callbacks:<...>, session_store:<...> }}")
    }
}

/// Builder type for [`ClientOptions`]
pub struct ClientOptionsBuilder {
    options: ClientOptions
}

impl ClientOptionsBuilder {

    /// Creates a new builder object.  The default options use no-op callbacks and a fresh
    /// [`InMemorySessionStore`].
    pub fn new() -> Self {
        ClientOptionsBuilder {
            options: ClientOptions {
                callbacks: Arc::new(NullCallbacks{}),
                session_store: Box::new(InMemorySessionStore::new()),
            }
        }
    }

    /// Sets the application callback handler
    pub fn with_callbacks(mut self, callbacks: Arc<dyn ClientCallbacks>) -> Self {
        self.options.callbacks = callbacks;
        self
    }

    /// Sets the store used to persist session state when clean start is disabled
    pub fn with_session_store(mut self, session_store: Box<dyn SessionStore>) -> Self {
        self.options.session_store = session_store;
        self
    }

    /// Creates a new ClientOptions object from what was configured on the builder.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

impl Default for ClientOptionsBuilder {
    fn default() -> Self {
        ClientOptionsBuilder::new()
    }
}

pub(crate) type ResponseHandler<T> = Box<dyn FnOnce(T) -> SchistResult<()> + Send>;

pub(crate) struct ConnectOptionsInternal {
    pub response_handler: Option<ResponseHandler<ConnectResult>>,
}

pub(crate) struct PublishOptionsInternal {
    pub options: PublishOptions,
    pub response_handler: Option<ResponseHandler<PublishResult>>,
}

pub(crate) struct SubscribeOptionsInternal {
    pub options: SubscribeOptions,
    pub response_handler: Option<ResponseHandler<SubscribeResult>>,
}

pub(crate) struct UnsubscribeOptionsInternal {
    pub options: UnsubscribeOptions,
    pub response_handler: Option<ResponseHandler<UnsubscribeResult>>,
}

pub(crate) enum OperationOptions {
    Connect(Box<ConnectionConfig>, ConnectOptionsInternal),
    Publish(Box<MqttPacket>, PublishOptionsInternal),
    Subscribe(Box<MqttPacket>, SubscribeOptionsInternal),
    Unsubscribe(Box<MqttPacket>, UnsubscribeOptionsInternal),
    Disconnect(bool),
    Close(),
}

/// An async MQTT 3.1.1 client.
///
/// The client is a thin handle: every call validates its arguments and then hands an intent to
/// the runtime task that owns the connection, the protocol state and the session.  Clones share
/// the same runtime task.
#[cfg(feature = "tokio")]
#[derive(Clone)]
pub struct MqttClient {
    pub(crate) operation_sender: tokio::sync::mpsc::UnboundedSender<OperationOptions>,
}

#[cfg(feature = "tokio")]
macro_rules! submit_client_operation {
    ($self:ident, $operation_type:ident, $options_internal_type: ident, $options_value: expr, $packet_value: expr) => ({

        let (response_sender, response_receiver) = tokio::sync::oneshot::channel();
        let response_handler = Box::new(move |res| {
            if response_sender.send(res).is_err() {
                return Err(SchistError::new_operation_channel_failure("operation result receiver dropped"));
            }

            Ok(())
        });
        let internal_options = $options_internal_type {
            options : $options_value.unwrap_or_default(),
            response_handler : Some(response_handler)
        };
        let send_failed = $self.operation_sender.send(OperationOptions::$operation_type($packet_value, internal_options)).is_err();
        Box::pin(async move {
            if send_failed {
                return Err(SchistError::new_operation_channel_failure("client runtime is no longer accepting operations"));
            }

            response_receiver.await?
        })
    })
}

#[cfg(feature = "tokio")]
impl MqttClient {

    /// Starts connecting to the broker described by `config`.
    ///
    /// The returned future resolves with the CONNACK of the first successful connection, or
    /// with the error that ended the first attempt.  After a successful connection the client
    /// reconnects on its own according to the configured reconnect options.  Configuration
    /// problems fail immediately with `PacketValidation` before any I/O.
    pub fn connect(&self, config: ConnectionConfig) -> Pin<Box<ConnectResultFuture>> {
        info!("client connect invoked for endpoint {}", config.endpoint());
        if let Err(error) = config.validate() {
            return Box::pin(async move { Err(error) });
        }

        let (response_sender, response_receiver) = tokio::sync::oneshot::channel();
        let response_handler : ResponseHandler<ConnectResult> = Box::new(move |res| {
            if response_sender.send(res).is_err() {
                return Err(SchistError::new_operation_channel_failure("connect result receiver dropped"));
            }

            Ok(())
        });

        let internal_options = ConnectOptionsInternal {
            response_handler: Some(response_handler)
        };

        let send_failed = self.operation_sender.send(OperationOptions::Connect(Box::new(config), internal_options)).is_err();
        Box::pin(async move {
            if send_failed {
                return Err(SchistError::new_operation_channel_failure("client runtime is no longer accepting operations"));
            }

            response_receiver.await?
        })
    }

    /// Publishes an application message.  Fails immediately with `PublishValidation` if the topic
    /// is empty, contains wildcards or is otherwise invalid.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, qos: QualityOfService, retain: bool) -> Pin<Box<PublishResultFuture>> {
        let packet = PublishPacket::builder(topic.to_string(), qos)
            .with_payload(payload)
            .with_retain(retain)
            .build();

        self.publish_packet(packet, None)
    }

    /// Submits a Publish operation built by the caller.  The publish will be sent to the broker
    /// when it reaches the head of the queue and the client is connected.
    pub fn publish_packet(&self, packet: PublishPacket, options: Option<PublishOptions>) -> Pin<Box<PublishResultFuture>> {
        debug!("Publish operation submitted");
        let boxed_packet = Box::new(MqttPacket::Publish(packet));
        if let Err(error) = validate_packet_outbound(&boxed_packet) {
            return Box::pin(async move { Err(error) });
        }

        submit_client_operation!(self, Publish, PublishOptionsInternal, options, boxed_packet)
    }

    /// Subscribes to a single topic filter.  Fails immediately with `SubscribeValidation` if the
    /// filter is malformed.
    pub fn subscribe(&self, topic_filter: &str, qos: QualityOfService) -> Pin<Box<SubscribeResultFuture>> {
        let packet = SubscribePacket::builder()
            .with_subscription_simple(topic_filter, qos)
            .build();

        self.subscribe_packet(packet, None)
    }

    /// Submits a Subscribe operation built by the caller.
    pub fn subscribe_packet(&self, packet: SubscribePacket, options: Option<SubscribeOptions>) -> Pin<Box<SubscribeResultFuture>> {
        debug!("Subscribe operation submitted");
        let boxed_packet = Box::new(MqttPacket::Subscribe(packet));
        if let Err(error) = validate_packet_outbound(&boxed_packet) {
            return Box::pin(async move { Err(error) });
        }

        submit_client_operation!(self, Subscribe, SubscribeOptionsInternal, options, boxed_packet)
    }

    /// Unsubscribes from a single topic filter.
    pub fn unsubscribe(&self, topic_filter: &str) -> Pin<Box<UnsubscribeResultFuture>> {
        let packet = UnsubscribePacket::builder()
            .with_topic_filter(topic_filter)
            .build();

        self.unsubscribe_packet(packet, None)
    }

    /// Submits an Unsubscribe operation built by the caller.
    pub fn unsubscribe_packet(&self, packet: UnsubscribePacket, options: Option<UnsubscribeOptions>) -> Pin<Box<UnsubscribeResultFuture>> {
        debug!("Unsubscribe operation submitted");
        let boxed_packet = Box::new(MqttPacket::Unsubscribe(packet));
        if let Err(error) = validate_packet_outbound(&boxed_packet) {
            return Box::pin(async move { Err(error) });
        }

        submit_client_operation!(self, Unsubscribe, UnsubscribeOptionsInternal, options, boxed_packet)
    }

    /// Ends the current connection and stops reconnecting.
    ///
    /// A graceful disconnect flushes a DISCONNECT packet first; otherwise the transport is simply
    /// closed and the broker will publish the last will, if one was configured.  In-flight
    /// exchanges survive for a later `connect` unless the session was started clean.
    pub fn disconnect(&self, graceful: bool) -> SchistResult<()> {
        info!("client disconnect invoked ({})", if graceful { "graceful" } else { "abrupt" });
        if self.operation_sender.send(OperationOptions::Disconnect(graceful)).is_err() {
            return Err(SchistError::new_operation_channel_failure("client runtime is no longer accepting operations"));
        }

        Ok(())
    }

    /// Tears the client down.  All incomplete operations fail with `ClientClosed` and the
    /// runtime task exits.  No further operations are possible.
    pub fn close(&self) -> SchistResult<()> {
        info!("client close invoked; no further operations allowed");
        if self.operation_sender.send(OperationOptions::Close()).is_err() {
            return Err(SchistError::new_operation_channel_failure("client runtime is no longer accepting operations"));
        }

        Ok(())
    }
}
