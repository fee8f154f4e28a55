/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::{ConnectReturnCode, PacketType};

use std::error::Error;
use std::fmt;

type BoxedSource = Box<dyn Error + Send + Sync + 'static>;

macro_rules! define_sourced_context {
    ($($context_type: ident => $variant_name: literal),+ $(,)?) => {
        $(
            #[doc = concat!("Additional details about a ", $variant_name, " error; the wrapped error is exposed through `source()`")]
            #[derive(Debug)]
            pub struct $context_type {
                source: BoxedSource
            }
        )+
    };
}

define_sourced_context!(
    OperationChannelFailureContext => "OperationChannelFailure",
    EncodingFailureContext => "EncodingFailure",
    MalformedPacketContext => "MalformedPacket",
    ProtocolErrorContext => "ProtocolError",
    ConnectionLostContext => "ConnectionLost",
    InternalStateErrorContext => "InternalStateError",
    PublishValidationContext => "PublishValidation",
    SubscribeValidationContext => "SubscribeValidation",
    SessionStoreFailureContext => "SessionStoreFailure",
    StdIoErrorContext => "StdIoError",
    TransportErrorContext => "TransportError",
    OtherErrorContext => "OtherError",
);

/// Additional details about a ConnectionEstablishmentFailure error
#[derive(Debug)]
pub struct ConnectionEstablishmentFailureContext {

    /// Set when the broker answered the CONNECT with a non-zero CONNACK return code
    pub return_code: Option<ConnectReturnCode>,

    source: BoxedSource
}

/// Additional details about a PacketValidation error
#[derive(Debug)]
pub struct PacketValidationContext {

    /// Kind of packet that was rejected
    pub packet_type: PacketType,

    source: BoxedSource
}

/// Marker context for AckTimeout errors
#[derive(Debug)]
pub struct AckTimeoutContext {
}

/// Marker context for ClientClosed errors
#[derive(Debug)]
pub struct ClientClosedContext {
}

/// Marker context for UserInitiatedDisconnect errors
#[derive(Debug)]
pub struct UserInitiatedDisconnectContext {
}

/// Basic error type for the entire schist-mqtt crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum SchistError {

    /// Failure encountered while using MQTT operation channel functionality
    OperationChannelFailure(OperationChannelFailureContext),

    /// Error encountered while attempting to encode an MQTT packet.  Examples include
    /// strings that do not fit in a length-prefixed field and packets whose remaining
    /// length exceeds the 268435455 byte ceiling.
    EncodingFailure(EncodingFailureContext),

    /// Error encountered while attempting to decode an MQTT packet.  Examples include
    /// bad header flags, invalid remaining length encodings, and truncated variable
    /// header fields.  Always fatal to the connection the packet arrived on.
    MalformedPacket(MalformedPacketContext),

    /// Generic error emitted when the client encounters broker behavior that violates the MQTT
    /// specification in a way that cannot be safely ignored or recovered from.
    ProtocolError(ProtocolErrorContext),

    /// Error emitted by the client when a connection attempt fails.  Failure is defined as
    /// "the attempt is finished for any reason prior to receipt of a successful Connack packet."
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// Error emitted when a successfully established connection is subsequently lost.  Transport
    /// failures, keep alive timeouts, and unexpected closes all surface as this variant.
    ConnectionLost(ConnectionLostContext),

    /// Error emitted by the client when something happens that should never happen.  Always indicates
    /// a bug in the client.
    InternalStateError(InternalStateErrorContext),

    /// Error emitted synchronously when a publish is submitted with an invalid topic or
    /// quality of service.  No network traffic is generated.
    PublishValidation(PublishValidationContext),

    /// Error emitted synchronously when a subscribe or unsubscribe is submitted with a
    /// malformed topic filter.  No network traffic is generated.
    SubscribeValidation(SubscribeValidationContext),

    /// Error emitted when a packet is submitted or received that violates the MQTT
    /// specification.
    PacketValidation(PacketValidationContext),

    /// Error applied to user-submitted operations that indicates the operation failed because
    /// we did not receive an Ack packet within the operation's timeout interval.
    AckTimeout(AckTimeoutContext),

    /// Error applied to all unfinished client operations when the client is closed by the user.
    ClientClosed(ClientClosedContext),

    /// Error emitted by the client after sending a user-submitted Disconnect packet as a part
    /// of a `disconnect()` invocation.  Does not indicate an actual failure.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// Error emitted when the configured session store fails to load, save, or clear
    /// session state.
    SessionStoreFailure(SessionStoreFailureContext),

    /// Generic error wrapping std::io::Error
    StdIoError(StdIoErrorContext),

    /// Generic error associated with caller-supplied transports.
    TransportError(TransportErrorContext),

    /// Error to be used when no other error variant is appropriate.
    OtherError(OtherErrorContext),
}

impl SchistError {

    pub(crate) fn new_operation_channel_failure(source: impl Into<BoxedSource>) -> Self {
        SchistError::OperationChannelFailure(OperationChannelFailureContext { source: source.into() })
    }

    pub(crate) fn new_encoding_failure(source: impl Into<BoxedSource>) -> Self {
        SchistError::EncodingFailure(EncodingFailureContext { source: source.into() })
    }

    pub(crate) fn new_malformed_packet(source: impl Into<BoxedSource>) -> Self {
        SchistError::MalformedPacket(MalformedPacketContext { source: source.into() })
    }

    pub(crate) fn new_protocol_error(source: impl Into<BoxedSource>) -> Self {
        SchistError::ProtocolError(ProtocolErrorContext { source: source.into() })
    }

    pub(crate) fn new_connection_establishment_failure(source: impl Into<BoxedSource>) -> Self {
        SchistError::ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext { return_code: None, source: source.into() })
    }

    pub(crate) fn new_connection_rejected(return_code: ConnectReturnCode) -> Self {
        let source = format!("CONNACK return code {}", return_code);
        SchistError::ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext { return_code: Some(return_code), source: source.into() })
    }

    pub(crate) fn new_connection_lost(source: impl Into<BoxedSource>) -> Self {
        SchistError::ConnectionLost(ConnectionLostContext { source: source.into() })
    }

    pub(crate) fn new_internal_state_error(source: impl Into<BoxedSource>) -> Self {
        SchistError::InternalStateError(InternalStateErrorContext { source: source.into() })
    }

    pub(crate) fn new_publish_validation(source: impl Into<BoxedSource>) -> Self {
        SchistError::PublishValidation(PublishValidationContext { source: source.into() })
    }

    pub(crate) fn new_subscribe_validation(source: impl Into<BoxedSource>) -> Self {
        SchistError::SubscribeValidation(SubscribeValidationContext { source: source.into() })
    }

    pub(crate) fn new_packet_validation(packet_type: PacketType, source: impl Into<BoxedSource>) -> Self {
        SchistError::PacketValidation(PacketValidationContext { packet_type, source: source.into() })
    }

    pub(crate) fn new_ack_timeout() -> Self {
        SchistError::AckTimeout(AckTimeoutContext {})
    }

    pub(crate) fn new_client_closed() -> Self {
        SchistError::ClientClosed(ClientClosedContext {})
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        SchistError::UserInitiatedDisconnect(UserInitiatedDisconnectContext {})
    }

    /// Wraps a failure from a custom `SessionStore` implementation
    pub fn new_session_store_failure(source: impl Into<BoxedSource>) -> Self {
        SchistError::SessionStoreFailure(SessionStoreFailureContext { source: source.into() })
    }

    /// Wraps an I/O failure that has no better classification
    #[doc(hidden)]
    pub fn new_std_io_error(source: impl Into<BoxedSource>) -> Self {
        SchistError::StdIoError(StdIoErrorContext { source: source.into() })
    }

    /// Wraps a failure raised by a caller-supplied transport or connection factory
    #[doc(hidden)]
    pub fn new_transport_error(source: impl Into<BoxedSource>) -> Self {
        SchistError::TransportError(TransportErrorContext { source: source.into() })
    }

    /// Catch-all wrapper
    #[doc(hidden)]
    pub fn new_other_error(source: impl Into<BoxedSource>) -> Self {
        SchistError::OtherError(OtherErrorContext { source: source.into() })
    }

    fn wrapped_source(&self) -> Option<&BoxedSource> {
        match self {
            SchistError::OperationChannelFailure(context) => { Some(&context.source) }
            SchistError::EncodingFailure(context) => { Some(&context.source) }
            SchistError::MalformedPacket(context) => { Some(&context.source) }
            SchistError::ProtocolError(context) => { Some(&context.source) }
            SchistError::ConnectionEstablishmentFailure(context) => { Some(&context.source) }
            SchistError::ConnectionLost(context) => { Some(&context.source) }
            SchistError::InternalStateError(context) => { Some(&context.source) }
            SchistError::PublishValidation(context) => { Some(&context.source) }
            SchistError::SubscribeValidation(context) => { Some(&context.source) }
            SchistError::PacketValidation(context) => { Some(&context.source) }
            SchistError::SessionStoreFailure(context) => { Some(&context.source) }
            SchistError::StdIoError(context) => { Some(&context.source) }
            SchistError::TransportError(context) => { Some(&context.source) }
            SchistError::OtherError(context) => { Some(&context.source) }
            SchistError::AckTimeout(_) | SchistError::ClientClosed(_) | SchistError::UserInitiatedDisconnect(_) => { None }
        }
    }
}

impl Error for SchistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.wrapped_source().map(|source| &**source as &(dyn Error + 'static))
    }
}

impl fmt::Display for SchistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary =
            match self {
                SchistError::OperationChannelFailure(_) => { "internal operation channel closed unexpectedly" }
                SchistError::EncodingFailure(_) => { "outbound packet could not be encoded" }
                SchistError::MalformedPacket(_) => { "inbound bytes do not form a valid MQTT 3.1.1 packet" }
                SchistError::ProtocolError(_) => { "broker violated the MQTT 3.1.1 protocol" }
                SchistError::ConnectionEstablishmentFailure(_) => { "connection attempt ended before an accepting CONNACK" }
                SchistError::ConnectionLost(_) => { "established connection was lost" }
                SchistError::InternalStateError(_) => { "client reached an impossible internal state" }
                SchistError::PublishValidation(_) => { "publish rejected before sending" }
                SchistError::SubscribeValidation(_) => { "topic filter rejected before sending" }
                SchistError::PacketValidation(context) => {
                    return write!(f, "{} failed validation ({})", context.packet_type, context.source);
                }
                SchistError::AckTimeout(_) => { "no acknowledgement arrived before the operation timeout" }
                SchistError::ClientClosed(_) => { "client was closed before the operation completed" }
                SchistError::UserInitiatedDisconnect(_) => { "connection closed by the user" }
                SchistError::SessionStoreFailure(_) => { "session store operation failed" }
                SchistError::StdIoError(_) => { "io error with no more specific classification" }
                SchistError::TransportError(_) => { "transport error" }
                SchistError::OtherError(_) => { "unclassified error" }
            };

        match self.wrapped_source() {
            Some(source) => { write!(f, "{} ({})", summary, source) }
            None => { write!(f, "{}", summary) }
        }
    }
}

impl From<std::io::Error> for SchistError {
    fn from(error: std::io::Error) -> Self {
        SchistError::new_std_io_error(error)
    }
}

impl From<core::str::Utf8Error> for SchistError {
    fn from(err: core::str::Utf8Error) -> Self {
        SchistError::new_malformed_packet(err)
    }
}

#[cfg(feature="tokio")]
impl From<tokio::sync::oneshot::error::RecvError> for SchistError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        SchistError::new_operation_channel_failure(err)
    }
}

#[cfg(feature="tokio")]
impl <T> From<tokio::sync::mpsc::error::SendError<T>> for SchistError
where T : Send + Sync + 'static {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SchistError::new_operation_channel_failure("client operation channel closed")
    }
}

#[cfg(feature="tokio")]
impl <T> From<tokio::sync::mpsc::error::TrySendError<T>> for SchistError
where T : Send + Sync + 'static {
    fn from(error: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match error {
            tokio::sync::mpsc::error::TrySendError::Full(_) => { SchistError::new_operation_channel_failure("client operation channel full") }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => { SchistError::new_operation_channel_failure("client operation channel closed") }
        }
    }
}

/// Crate-wide result type for functions that can fail
pub type SchistResult<T> = Result<T, SchistError>;

pub(crate) fn fold_schist_result<T>(base: SchistResult<T>, new_result: SchistResult<T>) -> SchistResult<T> {
    new_result?;
    base
}
