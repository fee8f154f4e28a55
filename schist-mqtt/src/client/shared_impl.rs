/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::backoff::*;
use crate::client::*;
use crate::config::*;
use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;
use crate::protocol::*;

use log::*;
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub(crate) enum ClientImplState {
    Stopped,
    Connecting,
    Connected,
    PendingReconnect,
    Shutdown,
}

impl fmt::Display for ClientImplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientImplState::Stopped => { write!(f, "Stopped") }
            ClientImplState::Connecting => { write!(f, "Connecting") }
            ClientImplState::Connected => { write!(f, "Connected") }
            ClientImplState::PendingReconnect => { write!(f, "PendingReconnect") }
            ClientImplState::Shutdown => { write!(f, "Shutdown") }
        }
    }
}

// Runtime-independent half of the client.  Owns the protocol state and decides which connection
// state the runtime should be in; the runtime owns the transport and timers.
pub(crate) struct MqttClientImpl {
    protocol_state: ProtocolState,
    callbacks: Arc<dyn ClientCallbacks>,

    current_state: ClientImplState,
    desired_state: ClientImplState,

    // Resolved by the first CONNACK after connect(), or by the failure of that first attempt
    pending_connect: Option<ResponseHandler<ConnectResult>>,
    graceful_disconnect_pending: bool,

    // Set once a connection succeeds after connect(); before that, a failed attempt stops the
    // client instead of scheduling a reconnect
    has_connected: bool,

    packet_events: VecDeque<PacketEvent>,
    last_error: Option<SchistError>,
    reported_state: ConnectionState,

    endpoint: Option<Endpoint>,
    connect_timeout: Duration,
    connection_attempt_start: Option<Instant>,
    backoff: ReconnectBackoff,
}

impl MqttClientImpl {

    pub(crate) fn new(options: ClientOptions, now: Instant) -> Self {
        debug!("Creating new MQTT client - client options: {:?}", options);

        let state_config = ProtocolStateConfig {
            base_timestamp: now,
            session_store: options.session_store,
        };

        MqttClientImpl {
            protocol_state: ProtocolState::new(state_config),
            callbacks: options.callbacks,
            current_state: ClientImplState::Stopped,
            desired_state: ClientImplState::Stopped,
            pending_connect: None,
            graceful_disconnect_pending: false,
            has_connected: false,
            packet_events: VecDeque::new(),
            last_error: None,
            reported_state: ConnectionState::Disconnected,
            endpoint: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_attempt_start: None,
            backoff: ReconnectBackoff::new(ReconnectOptions::default()),
        }
    }

    pub(crate) fn get_current_state(&self) -> ClientImplState {
        self.current_state
    }

    pub(crate) fn get_protocol_state(&self) -> ProtocolStateType {
        self.protocol_state.state()
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.reported_state
    }

    pub(crate) fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.clone()
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub(crate) fn apply_error(&mut self, error: SchistError) {
        debug!("Applying error to client: {}", error);

        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
    }

    fn handle_connect(&mut self, config: ConnectionConfig, mut options: ConnectOptionsInternal, now: Instant) {
        let response_handler = options.response_handler.take();

        if self.current_state != ClientImplState::Stopped || self.desired_state != ClientImplState::Stopped {
            warn!("client impl - connect rejected while in state {}", self.current_state);
            if let Some(handler) = response_handler {
                let _ = handler(Err(SchistError::new_other_error("client is already connecting or connected")));
            }
            return;
        }

        let endpoint = config.endpoint().clone();
        let connect_timeout = config.connect_timeout();
        let reconnect_options = *config.reconnect_options();

        if let Err(error) = self.protocol_state.begin_session(config, &now) {
            error!("client impl - unable to begin session: {}", error);
            if let Some(handler) = response_handler {
                let _ = handler(Err(error));
            }
            return;
        }

        debug!("Updating desired state to Connected");
        self.endpoint = Some(endpoint);
        self.connect_timeout = connect_timeout;
        self.backoff = ReconnectBackoff::new(reconnect_options);
        self.has_connected = false;
        self.pending_connect = response_handler;
        self.desired_state = ClientImplState::Connected;
    }

    fn handle_disconnect(&mut self, graceful: bool, now: Instant) {
        // a DISCONNECT may only follow a successful CONNACK
        if graceful && self.current_state == ClientImplState::Connected && self.protocol_state.state() == ProtocolStateType::Connected {
            debug!("Submitting disconnect operation to protocol state");
            let disconnect_context = UserEventContext {
                event: UserEvent::Disconnect(Box::new(MqttPacket::Disconnect(DisconnectPacket{}))),
                current_time: now
            };

            self.protocol_state.handle_user_event(disconnect_context);
            self.graceful_disconnect_pending = true;
        }

        if let Some(handler) = self.pending_connect.take() {
            let _ = handler(Err(SchistError::new_user_initiated_disconnect()));
        }

        debug!("Updating desired state to Stopped");
        self.desired_state = ClientImplState::Stopped;
    }

    pub(crate) fn handle_incoming_operation(&mut self, operation: OperationOptions, now: Instant) {
        match operation {
            OperationOptions::Connect(config, internal_options) => {
                debug!("Processing connect request");
                self.handle_connect(*config, internal_options, now);
            }
            OperationOptions::Publish(packet, internal_options) => {
                debug!("Submitting publish operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Publish(packet, internal_options),
                    current_time: now
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Subscribe(packet, internal_options) => {
                debug!("Submitting subscribe operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Subscribe(packet, internal_options),
                    current_time: now
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Unsubscribe(packet, internal_options) => {
                debug!("Submitting unsubscribe operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Unsubscribe(packet, internal_options),
                    current_time: now
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Disconnect(graceful) => {
                self.handle_disconnect(graceful, now);
            }
            OperationOptions::Close() => {
                debug!("Updating desired state to Shutdown");
                self.protocol_state.reset(&now);
                if let Some(handler) = self.pending_connect.take() {
                    let _ = handler(Err(SchistError::new_client_closed()));
                }
                self.desired_state = ClientImplState::Shutdown;
            }
        }

        self.update_connection_state();
    }

    fn dispatch_packet_events(&mut self, now: Instant) {
        let events = mem::take(&mut self.packet_events);

        for event in events {
            match event {
                PacketEvent::Publish(publish) => {
                    debug!("dispatch_packet_events - publish packet");
                    let message = IncomingMessage::from(publish);
                    self.callbacks.on_message(&message);
                }
                PacketEvent::Connack(connack) => {
                    debug!("dispatch_packet_events - connack packet");
                    self.has_connected = true;
                    self.backoff.on_connection_success(now);
                    if let Some(handler) = self.pending_connect.take() {
                        let _ = handler(Ok(connack));
                    }
                }
            }
        }

        self.update_connection_state();
    }

    fn capture_protocol_result(&mut self, result: SchistResult<()>) -> SchistResult<()> {
        match result {
            Err(error) => {
                self.apply_error(error); // this error propagates
                Err(SchistError::new_internal_state_error("unseen")) // this error does not propagate
            }
            _ => { Ok(()) }
        }
    }

    pub(crate) fn handle_incoming_bytes(&mut self, bytes: &[u8], now: Instant) -> SchistResult<()> {
        debug!("client impl - handle_incoming_bytes: {} bytes", bytes.len());
        let mut context = NetworkEventContext {
            event: NetworkEvent::IncomingData(bytes),
            current_time: now,
            packet_events: &mut self.packet_events
        };

        let result = self.protocol_state.handle_network_event(&mut context);
        self.dispatch_packet_events(now);

        self.capture_protocol_result(result)
    }

    pub(crate) fn handle_write_completion(&mut self, now: Instant) -> SchistResult<()> {
        debug!("client impl - handle_write_completion");
        let mut context = NetworkEventContext {
            event: NetworkEvent::WriteCompletion,
            current_time: now,
            packet_events: &mut self.packet_events
        };

        let result = self.protocol_state.handle_network_event(&mut context);
        self.capture_protocol_result(result)
    }

    pub(crate) fn handle_service(&mut self, outbound_data: &mut Vec<u8>, now: Instant) -> SchistResult<()> {
        debug!("client impl - handle_service");
        let mut context = ServiceContext {
            to_socket: outbound_data,
            current_time: now,
        };

        let result = self.protocol_state.service(&mut context);
        self.capture_protocol_result(result)
    }

    pub(crate) fn compute_reconnect_period(&mut self) -> Duration {
        let jitter_sample : f64 = rand::thread_rng().gen_range(0.0..=1.0);

        self.backoff.next_delay(jitter_sample)
    }

    pub(crate) fn compute_optional_state_transition(&self) -> Option<ClientImplState> {
        match self.current_state {
            ClientImplState::Stopped => {
                match self.desired_state {
                    ClientImplState::Connected => {
                        return Some(ClientImplState::Connecting)
                    }
                    ClientImplState::Shutdown => {
                        return Some(ClientImplState::Shutdown)
                    }
                    _ => {}
                }
            }

            ClientImplState::Connecting | ClientImplState::PendingReconnect => {
                if self.desired_state != ClientImplState::Connected {
                    return Some(ClientImplState::Stopped)
                }
            }

            ClientImplState::Connected => {
                if self.desired_state != ClientImplState::Connected && (!self.graceful_disconnect_pending || self.desired_state == ClientImplState::Shutdown) {
                    return Some(ClientImplState::Stopped);
                }
            }

            _ => { }
        }

        None
    }

    pub(crate) fn get_next_connected_service_time(&mut self, now: Instant) -> Option<Instant> {
        if self.current_state == ClientImplState::Connected {
            return self.protocol_state.get_next_service_timepoint(&now);
        }

        None
    }

    fn compute_connection_state(&self) -> ConnectionState {
        match self.current_state {
            ClientImplState::Stopped | ClientImplState::Shutdown => { ConnectionState::Disconnected }
            ClientImplState::Connecting => { ConnectionState::Connecting }
            ClientImplState::PendingReconnect => { ConnectionState::Reconnecting }
            ClientImplState::Connected => {
                if self.desired_state != ClientImplState::Connected {
                    return ConnectionState::Disconnecting;
                }

                match self.protocol_state.state() {
                    ProtocolStateType::PendingConnack => { ConnectionState::Connecting }
                    ProtocolStateType::Connected => { ConnectionState::Connected }
                    ProtocolStateType::PendingDisconnect => { ConnectionState::Disconnecting }
                    // transient; the runtime is about to leave the connected state
                    ProtocolStateType::Disconnected | ProtocolStateType::Halted => { self.reported_state }
                }
            }
        }
    }

    // Reports a connection state change to the application.  Returns the error that caused the
    // change, if any.
    fn update_connection_state(&mut self) -> Option<SchistError> {
        let state = self.compute_connection_state();
        if state == self.reported_state {
            return None;
        }

        let error = self.last_error.take();
        match &error {
            Some(error) => { info!("client connection state {} -> {} ({})", self.reported_state, state, error); }
            None => { info!("client connection state {} -> {}", self.reported_state, state); }
        }

        self.reported_state = state;
        self.callbacks.on_connection_state_changed(state, error.as_ref());

        error
    }

    pub(crate) fn transition_to_state(&mut self, mut new_state: ClientImplState, now: Instant) -> SchistResult<()> {
        let old_state = self.current_state;
        if old_state == new_state {
            return Ok(());
        }

        let user_requested_stop = self.desired_state != ClientImplState::Connected;

        // Short circuits:
        //  (1) a failed or finished connection only schedules a reconnect if the client still
        //      wants to be connected, has connected at least once since connect(), and has
        //      attempts left
        //  (2) Stopped has no natural exit other than operation receipt, so a pending close
        //      jumps straight to Shutdown
        if new_state == ClientImplState::PendingReconnect {
            if self.desired_state != ClientImplState::Connected {
                new_state = ClientImplState::Stopped;
            } else if !self.has_connected || !self.backoff.can_reconnect() {
                info!("client impl transition_to_state - not reconnecting (connected before: {}, attempts: {})", self.has_connected, self.backoff.attempts());
                self.desired_state = ClientImplState::Stopped;
                new_state = ClientImplState::Stopped;
            }
        }

        if new_state == ClientImplState::Stopped && self.desired_state == ClientImplState::Shutdown {
            new_state = ClientImplState::Shutdown;
        }

        debug!("client impl transition_to_state - old state: {}, new_state: {}", old_state, new_state);

        if new_state == ClientImplState::Connected {
            let attempt_start = self.connection_attempt_start.unwrap_or(now);
            let mut connection_opened_context = NetworkEventContext {
                event: NetworkEvent::ConnectionOpened(ConnectionOpenedContext {
                    establishment_timeout: attempt_start + self.connect_timeout,
                }),
                current_time: now,
                packet_events: &mut self.packet_events
            };

            self.protocol_state.handle_network_event(&mut connection_opened_context)?;
        } else if old_state == ClientImplState::Connected {
            if self.protocol_state.state() != ProtocolStateType::Disconnected {
                let mut connection_closed_context = NetworkEventContext {
                    event: NetworkEvent::ConnectionClosed,
                    current_time: now,
                    packet_events: &mut self.packet_events
                };

                self.protocol_state.handle_network_event(&mut connection_closed_context)?;
            }

            self.backoff.on_connection_closed(now);
        }

        if new_state == ClientImplState::Connecting {
            self.connection_attempt_start = Some(now);
        }

        if new_state == ClientImplState::Stopped {
            self.graceful_disconnect_pending = false;
            if self.protocol_state.session().clean_start() {
                if user_requested_stop {
                    self.protocol_state.abandon_session(&now, SchistError::new_user_initiated_disconnect);
                } else {
                    self.protocol_state.abandon_session(&now, generate_connection_stopped_error);
                }
            }
        }

        self.current_state = new_state;

        let error = self.update_connection_state();

        // a pending connect still unresolved at this point failed on its first attempt
        let connect_attempt_over = matches!(new_state, ClientImplState::Stopped | ClientImplState::PendingReconnect | ClientImplState::Shutdown);
        if connect_attempt_over {
            if let Some(handler) = self.pending_connect.take() {
                let error = error.unwrap_or_else(|| SchistError::new_connection_establishment_failure("connection attempt ended before a successful connack"));
                let _ = handler(Err(error));
            }
        }

        Ok(())
    }
}

fn generate_connection_stopped_error() -> SchistError {
    SchistError::new_connection_lost("client stopped after the connection was lost")
}
