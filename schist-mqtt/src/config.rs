/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring an MQTT connection.
 */

use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;
use crate::mqtt::connect::validate_connect_packet_outbound;

use log::*;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS : u16 = 60;
pub(crate) const DEFAULT_CONNECT_TIMEOUT : Duration = Duration::from_millis(4000);
pub(crate) const DEFAULT_WEBSOCKET_PATH : &str = "/mqtt";

/// Transport scheme of a broker endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EndpointScheme {

    /// Plain TCP.  Default port 1883.
    Mqtt,

    /// TLS over TCP.  Default port 8883.
    Mqtts,

    /// Websockets.  Default port 8083.
    Ws,

    /// Websockets over TLS.  Default port 8084.
    Wss,
}

impl EndpointScheme {

    /// Port used when an endpoint URI does not specify one
    pub fn default_port(&self) -> u16 {
        match self {
            EndpointScheme::Mqtt => { 1883 }
            EndpointScheme::Mqtts => { 8883 }
            EndpointScheme::Ws => { 8083 }
            EndpointScheme::Wss => { 8084 }
        }
    }

    /// True for the websocket schemes
    pub fn is_websocket(&self) -> bool {
        matches!(self, EndpointScheme::Ws | EndpointScheme::Wss)
    }

    /// True for the schemes that require TLS
    pub fn is_secure(&self) -> bool {
        matches!(self, EndpointScheme::Mqtts | EndpointScheme::Wss)
    }
}

impl FromStr for EndpointScheme {
    type Err = SchistError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => { Ok(EndpointScheme::Mqtt) }
            "mqtts" | "ssl" => { Ok(EndpointScheme::Mqtts) }
            "ws" => { Ok(EndpointScheme::Ws) }
            "wss" => { Ok(EndpointScheme::Wss) }
            _ => {
                error!("EndpointScheme Parse - unsupported scheme \"{}\"", value);
                Err(SchistError::new_other_error(format!("unsupported endpoint scheme: {}", value)))
            }
        }
    }
}

impl fmt::Display for EndpointScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointScheme::Mqtt => { write!(f, "mqtt") }
            EndpointScheme::Mqtts => { write!(f, "mqtts") }
            EndpointScheme::Ws => { write!(f, "ws") }
            EndpointScheme::Wss => { write!(f, "wss") }
        }
    }
}

/// Network location of an MQTT broker.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Endpoint {
    pub(crate) scheme: EndpointScheme,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: Option<String>,
}

impl Endpoint {

    /// Creates a new endpoint.  Websocket endpoints get the default `/mqtt` path.
    pub fn new(scheme: EndpointScheme, host: &str, port: u16) -> Self {
        Endpoint {
            scheme,
            host: host.to_string(),
            port,
            path: if scheme.is_websocket() { Some(DEFAULT_WEBSOCKET_PATH.to_string()) } else { None },
        }
    }

    /// Parses an endpoint from a URI such as `mqtt://localhost:1883` or `wss://broker.example.com/mqtt`.
    pub fn parse(uri: &str) -> SchistResult<Self> {
        let url = Url::parse(uri).map_err(|err| {
            error!("Endpoint Parse - invalid uri \"{}\": {}", uri, err);
            SchistError::new_other_error(err)
        })?;

        let scheme = EndpointScheme::from_str(url.scheme())?;

        let host =
            match url.host_str() {
                Some(host) if !host.is_empty() => {
                    host.trim_start_matches('[').trim_end_matches(']').to_string()
                }
                _ => {
                    error!("Endpoint Parse - uri \"{}\" has no host", uri);
                    return Err(SchistError::new_other_error("endpoint uri has no host"));
                }
            };

        let port = url.port().unwrap_or(scheme.default_port());

        let path =
            if scheme.is_websocket() {
                match url.path() {
                    "" | "/" => { Some(DEFAULT_WEBSOCKET_PATH.to_string()) }
                    path => { Some(path.to_string()) }
                }
            } else {
                None
            };

        Ok(Endpoint {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Transport scheme of the endpoint
    pub fn scheme(&self) -> EndpointScheme { self.scheme }

    /// Host name or address of the broker
    pub fn host(&self) -> &str { self.host.as_str() }

    /// Port of the broker
    pub fn port(&self) -> u16 { self.port }

    /// Websocket upgrade path.  None for non-websocket endpoints.
    pub fn path(&self) -> Option<&str> { self.path.as_deref() }
}

impl FromStr for Endpoint {
    type Err = SchistError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(uri)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)?;
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        }

        if let Some(path) = &self.path {
            write!(f, "{}", path)?;
        }

        Ok(())
    }
}

/// Authentication values sent in the CONNECT packet.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    pub(crate) username: String,
    pub(crate) password: Option<Vec<u8>>,
}

impl Credentials {

    /// Creates a new set of credentials
    pub fn new(username: &str, password: Option<&[u8]>) -> Self {
        Credentials {
            username: username.to_string(),
            password: password.map(|value| value.to_vec()),
        }
    }

    /// User name the broker may use for authentication and authorization
    pub fn username(&self) -> &str { self.username.as_str() }

    /// Opaque password data
    pub fn password(&self) -> Option<&[u8]> { self.password.as_deref() }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials {{ username: {:?}, password: ", self.username)?;
        if self.password.is_some() {
            write!(f, "<...redacted>")?;
        } else {
            write!(f, "None")?;
        }
        write!(f, " }}")
    }
}

/// Message the broker publishes on the client's behalf if the connection drops ungracefully.
///
/// See [MQTT311 Will Flag](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718031)
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LastWill {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QualityOfService,
    pub(crate) retain: bool,
}

impl LastWill {

    /// Creates a new last will message
    pub fn new(topic: &str, payload: Vec<u8>, qos: QualityOfService, retain: bool) -> Self {
        LastWill {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        }
    }

    /// Topic the will is published to
    pub fn topic(&self) -> &str { self.topic.as_str() }

    /// Will message payload
    pub fn payload(&self) -> &[u8] { self.payload.as_slice() }

    /// Quality of service the will is published with
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// Whether the broker retains the will message
    pub fn retain(&self) -> bool { self.retain }

    fn to_publish_packet(&self) -> PublishPacket {
        PublishPacket::builder(self.topic.clone(), self.qos)
            .with_retain(self.retain)
            .with_payload(self.payload.clone())
            .build()
    }
}

/// Controls what kind of jitter, if any, the client will apply to the exponential backoff waiting
/// period in-between connection attempts.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExponentialBackoffJitterType {

    /// The client will not perform any jitter to the backoff, leading to a rigid doubling of
    /// the reconnect time period.  Not recommended for real use; useful for correctness testing.
    None,

    /// The client will pick a wait duration uniformly between 0 and the current exponential
    /// backoff (which grows each time up to the maximum).
    #[default]
    Uniform
}

/// Automatic reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectOptions {
    pub(crate) enabled: bool,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) multiplier: f64,
    pub(crate) jitter: ExponentialBackoffJitterType,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) stability_reset_period: Duration,
}

impl ReconnectOptions {
    pub(crate) fn normalize(&mut self) {
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay)
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            self.multiplier = 1.0;
        }
    }

    /// Whether the client reconnects on its own after an unexpected connection loss
    pub fn enabled(&self) -> bool { self.enabled }

    /// Wait before the first reconnect attempt, prior to jitter
    pub fn initial_delay(&self) -> Duration { self.initial_delay }

    /// Upper bound on the wait between reconnect attempts
    pub fn max_delay(&self) -> Duration { self.max_delay }

    /// Growth factor applied to the wait after every failed attempt
    pub fn multiplier(&self) -> f64 { self.multiplier }

    /// Jitter applied to each wait
    pub fn jitter(&self) -> ExponentialBackoffJitterType { self.jitter }

    /// Optional cap on consecutive failed reconnect attempts
    pub fn max_attempts(&self) -> Option<u32> { self.max_attempts }

    /// How long a connection must stay up before the backoff resets
    pub fn stability_reset_period(&self) -> Duration { self.stability_reset_period }
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: ExponentialBackoffJitterType::default(),
            max_attempts: None,
            stability_reset_period: Duration::from_secs(10),
        }
    }
}

/// A builder for automatic reconnection behavior
#[derive(Debug, Default)]
pub struct ReconnectOptionsBuilder {
    options: ReconnectOptions
}

impl ReconnectOptionsBuilder {

    /// Creates a new builder object with default reconnect behavior
    pub fn new() -> Self {
        ReconnectOptionsBuilder {
            ..Default::default()
        }
    }

    /// Enables or disables automatic reconnection after an unexpected connection loss.
    pub fn with_enabled(&mut self, enabled: bool) -> &mut Self {
        self.options.enabled = enabled;
        self
    }

    /// Configures the wait before the first reconnect attempt.  Defaults to one second.
    pub fn with_initial_delay(&mut self, initial_delay: Duration) -> &mut Self {
        self.options.initial_delay = initial_delay;
        self
    }

    /// Configures the maximum wait between reconnect attempts.  Defaults to sixty seconds.
    pub fn with_max_delay(&mut self, max_delay: Duration) -> &mut Self {
        self.options.max_delay = max_delay;
        self
    }

    /// Configures the factor the wait grows by after every failed attempt.  Defaults to 2.
    pub fn with_multiplier(&mut self, multiplier: f64) -> &mut Self {
        self.options.multiplier = multiplier;
        self
    }

    /// Configures what kind of jitter, if any, should be applied to the waiting period between
    /// connection attempts.
    pub fn with_jitter(&mut self, jitter: ExponentialBackoffJitterType) -> &mut Self {
        self.options.jitter = jitter;
        self
    }

    /// Caps the number of consecutive failed reconnect attempts.  None (the default) never gives up.
    pub fn with_max_attempts(&mut self, max_attempts: Option<u32>) -> &mut Self {
        self.options.max_attempts = max_attempts;
        self
    }

    /// Configures the interval of time that the client must remain successfully connected before
    /// the exponential backoff for connection attempts is reset.  Defaults to ten seconds.
    pub fn with_stability_reset_period(&mut self, stability_reset_period: Duration) -> &mut Self {
        self.options.stability_reset_period = stability_reset_period;
        self
    }

    /// Builds a new set of reconnect options
    pub fn build(&self) -> ReconnectOptions {
        let mut options = self.options;
        options.normalize();
        options
    }
}

/// Creates a random client id of the form `mqtt_` followed by 8 hex characters.
pub fn generate_client_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("mqtt_{}", &uuid[..8])
}

/// Everything the client needs to know to establish, and re-establish, a connection to a broker.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub(crate) endpoint: Endpoint,
    pub(crate) client_id: String,
    pub(crate) clean_start: bool,
    pub(crate) keep_alive_seconds: u16,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_timeout: Option<Duration>,
    pub(crate) reconnect: ReconnectOptions,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) last_will: Option<LastWill>,
}

impl ConnectionConfig {

    /// Broker endpoint
    pub fn endpoint(&self) -> &Endpoint { &self.endpoint }

    /// Client id sent in every CONNECT packet
    pub fn client_id(&self) -> &str { self.client_id.as_str() }

    /// Whether the client discards prior session state when connecting
    pub fn clean_start(&self) -> bool { self.clean_start }

    /// Keep alive interval in seconds.  Zero disables keep alive.
    pub fn keep_alive_seconds(&self) -> u16 { self.keep_alive_seconds }

    /// Time allowed between opening a transport and receiving the CONNACK
    pub fn connect_timeout(&self) -> Duration { self.connect_timeout }

    /// Time allowed for a PINGRESP to arrive.  Defaults to the keep alive interval.
    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout.unwrap_or(self.keep_alive())
    }

    /// Reconnect behavior
    pub fn reconnect_options(&self) -> &ReconnectOptions { &self.reconnect }

    /// Optional authentication values
    pub fn credentials(&self) -> Option<&Credentials> { self.credentials.as_ref() }

    /// Optional last will message
    pub fn last_will(&self) -> Option<&LastWill> { self.last_will.as_ref() }

    pub(crate) fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds as u64)
    }

    pub(crate) fn to_connect_packet(&self) -> ConnectPacket {
        ConnectPacket {
            keep_alive_interval_seconds: self.keep_alive_seconds,
            clean_start: self.clean_start,
            client_id: self.client_id.clone(),
            username: self.credentials.as_ref().map(|credentials| credentials.username.clone()),
            password: self.credentials.as_ref().and_then(|credentials| credentials.password.clone()),
            will: self.last_will.as_ref().map(|will| will.to_publish_packet()),
        }
    }

    /// Checks the configuration against MQTT's CONNECT packet constraints.
    pub fn validate(&self) -> SchistResult<()> {
        validate_connect_packet_outbound(&self.to_connect_packet())
    }
}

/// A builder for connection configuration.
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig
}

impl ConnectionConfigBuilder {

    /// Creates a new builder targeting an endpoint.  All other settings take their defaults, including a
    /// randomly-generated client id.
    pub fn new(endpoint: Endpoint) -> Self {
        ConnectionConfigBuilder {
            config: ConnectionConfig {
                endpoint,
                client_id: generate_client_id(),
                clean_start: true,
                keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                ping_timeout: None,
                reconnect: ReconnectOptions::default(),
                credentials: None,
                last_will: None,
            }
        }
    }

    /// Creates a new builder from an endpoint URI.
    pub fn new_from_uri(uri: &str) -> SchistResult<Self> {
        Ok(ConnectionConfigBuilder::new(Endpoint::parse(uri)?))
    }

    /// Sets a unique string identifying the client to the server.  Used to restore session state
    /// between connections.
    ///
    /// See [MQTT311 Client Identifier](https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718031)
    pub fn with_client_id(&mut self, client_id: &str) -> &mut Self {
        self.config.client_id = client_id.to_string();
        self
    }

    /// Sets whether or not the broker and the client should discard prior session state on connect.
    pub fn with_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.config.clean_start = clean_start;
        self
    }

    /// Sets the maximum time interval, in seconds, that is permitted to elapse between the point at which
    /// the client finishes transmitting one MQTT packet and the point it starts sending the next.  The
    /// client will use PINGREQ packets to maintain this property.  Zero disables keep alive.
    pub fn with_keep_alive_seconds(&mut self, keep_alive_seconds: u16) -> &mut Self {
        self.config.keep_alive_seconds = keep_alive_seconds;
        self
    }

    /// Configures how long the client will wait for a CONNACK after the transport has been
    /// established.
    pub fn with_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.config.connect_timeout = connect_timeout;
        self
    }

    /// Configures how long, after sending a PINGREQ, the client will wait for a PINGRESP from the
    /// broker before giving up and shutting down the connection.
    pub fn with_ping_timeout(&mut self, ping_timeout: Duration) -> &mut Self {
        self.config.ping_timeout = Some(ping_timeout);
        self
    }

    /// Configures automatic reconnection.
    pub fn with_reconnect_options(&mut self, reconnect: ReconnectOptions) -> &mut Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Sets the user name and optional password sent in the CONNECT packet.
    pub fn with_credentials(&mut self, credentials: Credentials) -> &mut Self {
        self.config.credentials = Some(credentials);
        self
    }

    /// Configures a message the broker publishes if the connection is lost ungracefully.
    pub fn with_last_will(&mut self, last_will: LastWill) -> &mut Self {
        self.config.last_will = Some(last_will);
        self
    }

    /// Builds a new connection configuration
    pub fn build(&self) -> ConnectionConfig {
        self.config.clone()
    }
}
