/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

// Internal module that implements MQTT 3.1.1 client protocol behavior without performing any I/O

use crate::client::*;
use crate::config::*;
use crate::decode::*;
use crate::encode::*;
use crate::encode::utils::MAXIMUM_VARIABLE_LENGTH_INTEGER;
use crate::error::{fold_schist_result, SchistError, SchistResult};
use crate::keep_alive::*;
use crate::logging::PacketFields;
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::session::*;
use crate::validate::utils::topic_matches_filter;

use log::*;

// Prefixes a log line with the elapsed time of the event being processed
macro_rules! state_log {
    ($state:expr, $level:ident, $($arg:tt)+) => {
        $level!("[{} ms] {}", $state.elapsed_time_ms, format_args!($($arg)+))
    };
}

use std::cmp::{Ordering, Reverse};
use std::collections::*;
use std::fmt::*;
use std::mem;
use std::time::*;

enum ClientOperationOptions {
    Publish(PublishOptionsInternal),
    Subscribe(SubscribeOptionsInternal),
    Unsubscribe(UnsubscribeOptionsInternal),
}

// Data structure that tracks the state of an MQTT operation.  This includes both user-submitted
// operations and internally-generated ones.  Every outbound packet corresponds to an operation.
// A qos2 publish is the one operation that owns two outbound packets: the publish and, once the
// broker has sent PUBREC, the pubrel.
pub(crate) struct ClientOperation {

    // Every operation has a unique id, starting at 1.  Id allocation is serialized based on
    // time-of-submission, so submission order is a sort of the id sequence.
    id: u64,

    // The base packet associated with this operation.  Operations restored from a stored session
    // in the AwaitingPubComp stage carry the pubrel here directly.
    pub(crate) packet: Box<MqttPacket>,

    // Set when a PUBREC arrives for a qos2 publish
    pub(crate) qos2_pubrel: Option<Box<MqttPacket>>,

    // MQTT packet id that has been assigned to this operation.  Assignment is also reflected in
    // the packet itself.
    packet_id: Option<u16>,

    // Completion channel for user-submitted operations; None for internal ones
    options: Option<ClientOperationOptions>,
}

impl ClientOperation {
    pub(crate) fn bind_packet_id(&mut self, packet_id: u16) -> SchistResult<()> {
        match &mut *self.packet {
            MqttPacket::Subscribe(subscribe) => {
                debug!("Subscribe operation {} binding to packet id {}", self.id, packet_id);
                subscribe.packet_id = packet_id;
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                debug!("Unsubscribe operation {} binding to packet id {}", self.id, packet_id);
                unsubscribe.packet_id = packet_id;
            }
            MqttPacket::Publish(publish) => {
                debug!("Publish operation {} binding to packet id {}", self.id, packet_id);
                publish.packet_id = packet_id;
            }
            MqttPacket::Pubrel(pubrel) => {
                debug!("Pubrel operation {} binding to packet id {}", self.id, packet_id);
                pubrel.packet_id = packet_id;
            }
            _ => {
                error!("{} operation {} cannot be bound to a packet id", mqtt_packet_to_str(&self.packet), self.id);
                return Err(SchistError::new_internal_state_error("invalid packet type for packet id binding"));
            }
        }

        self.packet_id = Some(packet_id);
        Ok(())
    }

    // The packet that goes out the next time this operation is written
    pub(crate) fn outbound_packet(&self) -> &MqttPacket {
        if let Some(pubrel) = &self.qos2_pubrel {
            return pubrel;
        }

        &self.packet
    }

    fn is_awaiting_pubcomp(&self) -> bool {
        self.qos2_pubrel.is_some() || matches!(&*self.packet, MqttPacket::Pubrel(_))
    }
}

// Inbound packets the client itself needs to see
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum PacketEvent {
    Connack(ConnackPacket),
    Publish(PublishPacket),
}

pub(crate) struct ConnectionOpenedContext {
    pub(crate) establishment_timeout: Instant,
}

// Transport-level happenings, reported by whatever runtime owns the socket
pub(crate) enum NetworkEvent<'a> {
    ConnectionOpened(ConnectionOpenedContext),
    ConnectionClosed,
    IncomingData(&'a [u8]),
    WriteCompletion
}

pub(crate) struct NetworkEventContext<'a> {
    pub(crate) event: NetworkEvent<'a>,
    pub(crate) current_time: Instant,

    pub(crate) packet_events: &'a mut VecDeque<PacketEvent>,
}

// Operations submitted through the client.  Connecting is driven by begin_session and the
// runtime, not by a user event.
pub(crate) enum UserEvent {
    Publish(Box<MqttPacket>, PublishOptionsInternal),
    Subscribe(Box<MqttPacket>, SubscribeOptionsInternal),
    Unsubscribe(Box<MqttPacket>, UnsubscribeOptionsInternal),
    Disconnect(Box<MqttPacket>)
}

pub(crate) struct UserEventContext {
    pub(crate) event: UserEvent,
    pub(crate) current_time: Instant,
}

pub(crate) struct ServiceContext<'a> {
    // encoded bytes go here; capacity caps how much is encoded per write cycle
    pub(crate) to_socket: &'a mut Vec<u8>,
    pub(crate) current_time: Instant,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ProtocolStateType {
    Disconnected,
    PendingConnack,
    Connected,
    PendingDisconnect,
    Halted
}

impl Display for ProtocolStateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        Debug::fmt(self, f)
    }
}

pub(crate) struct ProtocolStateConfig {
    pub base_timestamp: Instant,

    pub session_store: Box<dyn SessionStore>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProtocolQueueType {
    User,
    Resubmit,
    HighPriority,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ProtocolQueueServiceMode {
    All,
    HighPriorityOnly,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProtocolEnqueuePosition {
    Front,
    Back
}

enum OperationResponse {
    Publish(PublishResponse),
    Subscribe(SubackPacket),
    Unsubscribe(UnsubackPacket),
}

// What happens to the operation that was being encoded when the connection dropped
enum InterruptedOperationDisposition {
    Requeue(ProtocolQueueType),
    Retain,
    Fail,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct OperationTimeoutRecord {
    id: u64,
    timeout: Instant
}

impl PartialOrd for OperationTimeoutRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperationTimeoutRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timeout.cmp(&other.timeout)
    }
}

// Sans-IO MQTT engine.  Owns the session, the operation queues and every protocol timer;
// all input arrives as events stamped with the caller's notion of now.
pub(crate) struct ProtocolState {
    pub(crate) config: ProtocolStateConfig,

    pub(crate) state: ProtocolStateType,

    // set by begin_session
    pub(crate) connection_config: Option<ConnectionConfig>,

    // persisted after each event that dirties it, unless clean start is on
    pub(crate) session: Session,
    pub(crate) session_dirty: bool,
    pub(crate) session_initialized: bool,

    // time of the event being processed; elapsed is relative to the base timestamp and only
    // used for logging
    pub(crate) current_time: Instant,
    pub(crate) elapsed_time_ms: u128,

    // nothing new is encoded until the runtime reports the previous bytes written
    pub(crate) pending_write_completion: bool,

    // { operation id -> operation }
    pub(crate) operations: HashMap<u64, ClientOperation>,

    // ack deadlines, armed when an ack-based operation is written out
    pub(crate) operation_ack_timeouts: BinaryHeap<Reverse<OperationTimeoutRecord>>,

    // Queues are drained high priority first, then resubmit, then user

    // new user operations
    pub(crate) user_operation_queue: VecDeque<u64>,

    // interrupted publishes and pubrels, replayed in their original order with their original ids
    pub(crate) resubmit_operation_queue: VecDeque<u64>,

    // connect, acks, pings, disconnect and the resubscribe
    pub(crate) high_priority_operation_queue: VecDeque<u64>,

    // the operation the encoder is working through
    pub(crate) current_operation: Option<u64>,

    // internal subscribe restoring tracked subscriptions after the broker lost the session
    pub(crate) resubscribe_operation: Option<u64>,

    // outbound ids in use, kept across reconnects
    // { packet id -> operation id }
    pub(crate) allocated_packet_ids: HashMap<u16, u64>,

    // written qos1+ publishes and pubrels awaiting an ack
    // { packet id -> operation id }
    pub(crate) pending_publish_operations: HashMap<u16, u64>,

    // written subscribes and unsubscribes awaiting an ack
    // { packet id -> operation id }
    pub(crate) pending_non_publish_operations: HashMap<u16, u64>,

    // ids whose operation failed with an ack timeout; a late ack for one of these is dropped
    pub(crate) timed_out_packet_ids: HashSet<u16>,

    // ack-less operations that complete on the next write completion
    pub(crate) pending_write_completion_operations: VecDeque<u64>,

    pub(crate) next_operation_id: u64,

    // next candidate id; wraps from 65535 back to 1
    pub(crate) next_packet_id: u16,

    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,

    pub(crate) keep_alive: KeepAliveTimer,

    pub(crate) connack_timeout_timepoint: Option<Instant>,
}

// Counts at debug level; trace level adds the queue contents and id maps
impl Display for ProtocolState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let mut fields = PacketFields::begin(f, "ProtocolState")?;
        fields.value("state", self.state)?;
        fields.value("elapsed_ms", self.elapsed_time_ms)?;
        fields.value("pending_write_completion", self.pending_write_completion)?;
        fields.value("operations", self.operations.len())?;
        fields.value("ack_timeouts", self.operation_ack_timeouts.len())?;
        fields.value("current_operation", format_args!("{:?}", self.current_operation))?;
        fields.value("session", format_args!("{}s/{}o/{}i",
            self.session.subscriptions.len(), self.session.outbound.len(), self.session.inbound.len()))?;
        fields.value("next_ids", format_args!("op {}, packet {}", self.next_operation_id, self.next_packet_id))?;

        if log::max_level() < LevelFilter::Trace {
            fields.value("queued", format_args!("{}/{}/{}",
                self.high_priority_operation_queue.len(), self.resubmit_operation_queue.len(), self.user_operation_queue.len()))?;
            fields.value("awaiting_ack", format_args!("{}/{}",
                self.pending_publish_operations.len(), self.pending_non_publish_operations.len()))?;
            fields.value("awaiting_write", self.pending_write_completion_operations.len())?;
            return fields.finish();
        }

        fields.value("high_priority_queue", format_args!("{:?}", self.high_priority_operation_queue))?;
        fields.value("resubmit_queue", format_args!("{:?}", self.resubmit_operation_queue))?;
        fields.value("user_queue", format_args!("{:?}", self.user_operation_queue))?;
        fields.value("allocated_packet_ids", format_args!("{:?}", self.allocated_packet_ids))?;
        fields.value("awaiting_publish_ack", format_args!("{:?}", self.pending_publish_operations))?;
        fields.value("awaiting_other_ack", format_args!("{:?}", self.pending_non_publish_operations))?;
        fields.value("timed_out_packet_ids", format_args!("{:?}", self.timed_out_packet_ids))?;
        fields.value("awaiting_write", format_args!("{:?}", self.pending_write_completion_operations))?;
        fields.value("outbound_stages", format_args!("{:?}",
            self.session.outbound.iter().map(|(id, exchange)| (*id, exchange.stage)).collect::<Vec<(u16, ExchangeStage)>>()))?;
        fields.value("inbound_ids", format_args!("{:?}", self.session.inbound.keys().collect::<Vec<&u16>>()))?;
        fields.finish()
    }
}

impl ProtocolState {

    // Crate-public API

    pub(crate) fn new(config: ProtocolStateConfig) -> ProtocolState {
        let base_time = config.base_timestamp;

        ProtocolState {
            config,
            state: ProtocolStateType::Disconnected,
            connection_config: None,
            session: Session::new("", true),
            session_dirty: false,
            session_initialized: false,
            current_time: base_time,
            elapsed_time_ms: 0,
            pending_write_completion : false,
            operations: HashMap::new(),
            operation_ack_timeouts: BinaryHeap::new(),
            user_operation_queue: VecDeque::new(),
            resubmit_operation_queue: VecDeque::new(),
            high_priority_operation_queue: VecDeque::new(),
            current_operation: None,
            resubscribe_operation: None,
            allocated_packet_ids: HashMap::new(),
            pending_publish_operations: HashMap::new(),
            pending_non_publish_operations: HashMap::new(),
            timed_out_packet_ids: HashSet::new(),
            pending_write_completion_operations: VecDeque::new(),
            next_operation_id : 1,
            next_packet_id : 1,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            keep_alive: KeepAliveTimer::new(Duration::ZERO, Duration::ZERO),
            connack_timeout_timepoint: None,
        }
    }

    pub(crate) fn state(&self) -> ProtocolStateType {
        self.state
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    /// Binds the protocol state to a connection configuration and sets up the session that the
    /// following connections will use.
    ///
    /// With clean start every unfinished exchange of the previous session is discarded and any
    /// stored session is removed.  Without clean start the in-memory session is kept if it belongs
    /// to the same client id; otherwise the stored session, if any, is loaded and its unfinished
    /// exchanges are queued for retransmission.
    pub(crate) fn begin_session(&mut self, config: ConnectionConfig, current_time: &Instant) -> SchistResult<()> {
        self.update_internal_clock(current_time);

        if self.state != ProtocolStateType::Disconnected {
            state_log!(self, error, "begin_session - called in invalid state {}", self.state);
            return Err(SchistError::new_internal_state_error("session cannot change while connected"));
        }

        self.keep_alive = KeepAliveTimer::new(config.keep_alive(), config.ping_timeout());

        let client_id = config.client_id().to_string();
        if config.clean_start() {
            state_log!(self, info, "begin_session - starting clean session for client \"{}\"", client_id);
            self.discard_session_operations();

            if let Err(error) = self.config.session_store.clear(&client_id) {
                state_log!(self, error, "begin_session - failed to clear stored session: {}", error);
            }

            self.session = Session::new(&client_id, true);
            self.session_dirty = false;
        } else if !self.session_initialized || self.session.client_id != client_id {
            self.discard_session_operations();

            let stored_session =
                match self.config.session_store.load(&client_id) {
                    Ok(stored_session) => { stored_session }
                    Err(error) => {
                        state_log!(self, error, "begin_session - failed to load stored session: {}", error);
                        None
                    }
                };

            if let Some(stored_session) = stored_session {
                self.restore_session(stored_session);
            } else {
                state_log!(self, info, "begin_session - no stored session for client \"{}\"", client_id);
                self.session = Session::new(&client_id, false);
            }

            self.session_dirty = true;
        } else {
            state_log!(self, info, "begin_session - resuming in-memory session for client \"{}\"", client_id);
            self.session_dirty = true;
        }

        self.session.clean_start = config.clean_start();
        self.session_initialized = true;
        self.connection_config = Some(config);

        self.persist_session();
        self.log_state();

        Ok(())
    }

    /// Drops the session entirely: every incomplete operation is failed and the stored session, if
    /// any, is removed.  Used when a clean start client stops for good.
    pub(crate) fn abandon_session(&mut self, current_time: &Instant, error_fn: fn() -> SchistError) {
        self.update_internal_clock(current_time);

        state_log!(self, info, "abandon_session - failing {} incomplete operations", self.operations.len());

        let operations : Vec<u64> = self.operations.keys().copied().collect();
        let _ = self.complete_operation_sequence_as_failure(operations.into_iter(), error_fn);

        self.clear_operation_tracking();

        if let Some(config) = &self.connection_config {
            if let Err(error) = self.config.session_store.clear(config.client_id()) {
                state_log!(self, error, "abandon_session - failed to clear stored session: {}", error);
            }

            self.session = Session::new(config.client_id(), true);
        }

        self.session_dirty = false;
        self.session_initialized = false;
    }

    pub(crate) fn handle_network_event(&mut self, context: &mut NetworkEventContext) -> SchistResult<()> {
        self.update_internal_clock(&context.current_time);

        let event = &context.event;
        let result =
            match &event {
                NetworkEvent::ConnectionOpened(opened_context) => {
                    let establishment_timeout = opened_context.establishment_timeout;
                    self.handle_network_event_connection_opened(establishment_timeout)
                }
                NetworkEvent::ConnectionClosed => { self.handle_network_event_connection_closed() }
                NetworkEvent::WriteCompletion => { self.handle_network_event_write_completion() }
                NetworkEvent::IncomingData(data) => { self.handle_network_event_incoming_data(data, context.packet_events) }
            };

        self.persist_session();
        self.log_state();

        // Any error state returned from an event handler halts the client.  This is not always
        // an ERROR-error.  For example, write completion that includes a disconnect packet will
        // return an error, allowing us to reset the client nicely.
        if result.is_err() {
            state_log!(self, error, "handle_network_event - final result: {:?}", result);
            self.change_state(ProtocolStateType::Halted);
        } else {
            state_log!(self, debug, "handle_network_event - final result: {:?}", result);
        }

        result
    }

    pub(crate) fn service(&mut self, context: &mut ServiceContext) -> SchistResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match self.state {
                ProtocolStateType::Disconnected => { self.service_disconnected(context) }
                ProtocolStateType::PendingConnack => { self.service_pending_connack(context) }
                ProtocolStateType::Connected => { self.service_connected(context) }
                ProtocolStateType::PendingDisconnect => { self.service_pending_disconnect(context) }
                ProtocolStateType::Halted => { Err(SchistError::new_internal_state_error("protocol state previously halted")) }
            };

        self.persist_session();
        self.log_state();

        // Any error state returned from an event handler halts the client.
        if result.is_err() {
            state_log!(self, error, "service - final result: {:?}", result);
            self.change_state(ProtocolStateType::Halted);
        } else {
            state_log!(self, debug, "service - final result: {:?}", result);
        }

        result
    }

    pub(crate) fn handle_user_event(&mut self, context: UserEventContext) {
        self.update_internal_clock(&context.current_time);

        let event = context.event;
        let (op_id, queue, position) =
            match event {
                UserEvent::Subscribe(packet, subscribe_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Subscribe(subscribe_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Unsubscribe(packet, unsubscribe_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Unsubscribe(unsubscribe_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Publish(packet, publish_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Publish(publish_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Disconnect(disconnect) => {
                    (self.create_operation(disconnect, None), ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front)
                }
            };

        state_log!(self, debug, "handle_user_event - queuing operation {} at {:?} of {:?} queue", op_id, position, queue);
        self.enqueue_operation(op_id, queue, position);

        self.log_state();
    }

    pub(crate) fn get_next_service_timepoint(&mut self, current_time: &Instant) -> Option<Instant> {
        self.update_internal_clock(current_time);

        let next_service_time =
            match self.state {
                ProtocolStateType::Disconnected => { self.get_next_service_timepoint_disconnected() }
                ProtocolStateType::PendingConnack => { self.get_next_service_timepoint_pending_connack() }
                ProtocolStateType::Connected => { self.get_next_service_timepoint_connected() }
                ProtocolStateType::PendingDisconnect => { self.get_next_service_timepoint_pending_disconnect() }
                ProtocolStateType::Halted => { None }
            };

        if let Some(next_timepoint) = &next_service_time {
            state_log!(self, debug, "get_next_service_timepoint - state {}, target_elapsed_time: {} ms", self.state, self.get_elapsed_millis(next_timepoint));
        } else {
            state_log!(self, debug, "get_next_service_timepoint - state {}, target_elapsed_time: NEVER", self.state);
        }

        next_service_time
    }

    /// Fails every incomplete operation with ClientClosed and forgets all connection and session
    /// tracking.  The session store is left untouched.
    pub(crate) fn reset(&mut self, current_time: &Instant) {
        self.update_internal_clock(current_time);

        self.state = ProtocolStateType::Disconnected;

        let operations : Vec<u64> = self.operations.keys().copied().collect();
        for id in operations {
            let _ = self.complete_operation_as_failure(id, SchistError::new_client_closed());
        }

        self.clear_operation_tracking();
        self.keep_alive.stop();
        self.connack_timeout_timepoint = None;
        self.session_dirty = false;
        self.session_initialized = false;
    }

    // Private Implementation

    fn clear_operation_tracking(&mut self) {
        self.pending_write_completion = false;
        self.operations.clear();
        self.operation_ack_timeouts.clear();
        self.user_operation_queue.clear();
        self.resubmit_operation_queue.clear();
        self.high_priority_operation_queue.clear();
        self.current_operation = None;
        self.resubscribe_operation = None;
        self.allocated_packet_ids.clear();
        self.pending_publish_operations.clear();
        self.pending_non_publish_operations.clear();
        self.timed_out_packet_ids.clear();
        self.pending_write_completion_operations.clear();
        self.next_packet_id = 1;
    }

    fn log_state(&self) {
        if log::max_level() >= LevelFilter::Debug {
            debug!("{}", self);
        }
    }

    fn update_internal_clock(&mut self, current_time: &Instant) {
        self.current_time = *current_time;
        self.elapsed_time_ms = current_time.saturating_duration_since(self.config.base_timestamp).as_millis();
    }

    fn get_elapsed_millis(&self, timepoint: &Instant) -> u128 {
        timepoint.saturating_duration_since(self.config.base_timestamp).as_millis()
    }

    fn persist_session(&mut self) {
        if !self.session_dirty {
            return;
        }

        self.session_dirty = false;
        if self.session.clean_start {
            return;
        }

        if let Err(error) = self.config.session_store.save(&self.session) {
            state_log!(self, error, "persist_session - failed to save session for client \"{}\": {}", self.session.client_id, error);
        }
    }

    // Rebuilds operations for every unfinished outbound exchange of a stored session.  Publishes
    // and pubrels go to the resubmit queue in packet id order; subscribes and unsubscribes go to
    // the user queue.
    fn restore_session(&mut self, mut session: Session) {
        state_log!(self, info, "restore_session - restoring session for client \"{}\": {} subscriptions, {} outbound, {} inbound",
            session.client_id, session.subscriptions.len(), session.outbound.len(), session.inbound.len());

        let exchanges : Vec<InFlightExchange> = session.outbound.values().cloned().collect();
        for exchange in exchanges {
            let packet_id = exchange.packet_id;
            let mut packet = exchange.packet;

            let queue =
                match (exchange.stage, &mut packet) {
                    (ExchangeStage::AwaitingPubAck | ExchangeStage::AwaitingPubRec, MqttPacket::Publish(publish)) => {
                        publish.duplicate = true;
                        ProtocolQueueType::Resubmit
                    }
                    (ExchangeStage::AwaitingPubComp, MqttPacket::Pubrel(_)) => {
                        ProtocolQueueType::Resubmit
                    }
                    (ExchangeStage::AwaitingSubAck, MqttPacket::Subscribe(_)) | (ExchangeStage::AwaitingUnsubAck, MqttPacket::Unsubscribe(_)) => {
                        ProtocolQueueType::User
                    }
                    _ => {
                        state_log!(self, warn, "restore_session - dropping inconsistent {} exchange for packet id {}", exchange.stage, packet_id);
                        session.outbound.remove(&packet_id);
                        continue;
                    }
                };

            let id = self.create_operation(Box::new(packet), None);
            if let Err(error) = self.bind_operation_packet_id(id, packet_id) {
                state_log!(self, warn, "restore_session - could not bind packet id {}: {}", packet_id, error);
                self.operations.remove(&id);
                session.outbound.remove(&packet_id);
                continue;
            }

            self.enqueue_operation(id, queue, ProtocolEnqueuePosition::Back);
        }

        self.session = session;
    }

    // Fails every operation that belongs to an unfinished exchange of the current session.
    fn discard_session_operations(&mut self) {
        let discarded : Vec<u64> = self.operations.iter().filter(|(id, operation)| {
            self.resubmit_operation_queue.contains(id) ||
                operation.packet_id.map_or(false, |packet_id| self.session.outbound.contains_key(&packet_id))
        }).map(|(id, _)| *id).collect();

        if discarded.is_empty() {
            return;
        }

        state_log!(self, info, "discard_session_operations - discarding {} in-flight operations", discarded.len());
        let _ = self.complete_operation_sequence_as_failure(discarded.into_iter(), generate_session_discarded_error);

        self.user_operation_queue.retain(|id| self.operations.contains_key(id));
        self.resubmit_operation_queue.clear();
        self.high_priority_operation_queue.retain(|id| self.operations.contains_key(id));
    }

    fn should_retain_high_priority_operation(&self, id: u64) -> bool {
        if let Some(operation) = self.operations.get(&id) {
            return operation.is_awaiting_pubcomp();
        }

        false
    }

    fn partition_high_priority_queue_for_disconnect<T>(&self, iterator: T) -> (VecDeque<u64>, VecDeque<u64>) where T : Iterator<Item = u64> {
        let mut retained = VecDeque::new();
        let mut rejected = VecDeque::new();

        iterator.for_each(|id| {
            if self.should_retain_high_priority_operation(id) {
                retained.push_back(id);
            } else {
                rejected.push_back(id);
            }
        });

        (retained, rejected)
    }

    fn apply_disconnect_completion(&mut self, operation: &ClientOperation) -> SchistResult<()> {
        if let MqttPacket::Disconnect(_) = &*operation.packet {
            if self.state == ProtocolStateType::PendingDisconnect {
                self.state = ProtocolStateType::Halted;
            }
            state_log!(self, info, "apply_disconnect_completion - user-requested disconnect operation {} completed", operation.id);
            return Err(SchistError::new_user_initiated_disconnect());
        }

        Ok(())
    }

    fn release_operation_packet_id(&mut self, operation: &ClientOperation) {
        if let Some(packet_id) = operation.packet_id {
            self.allocated_packet_ids.remove(&packet_id);
            self.pending_publish_operations.remove(&packet_id);
            self.pending_non_publish_operations.remove(&packet_id);

            if self.session.outbound.remove(&packet_id).is_some() {
                self.session_dirty = true;
            }
        }
    }

    fn complete_operation_as_success(&mut self, id : u64, completion_result: Option<OperationResponse>) -> SchistResult<()> {
        let mut operation =
            match self.operations.remove(&id) {
                Some(operation) => { operation }
                None => {
                    state_log!(self, error, "complete_operation_as_success - operation id {} does not exist", id);
                    return Err(SchistError::new_internal_state_error("cannot complete an operation that does not exist"));
                }
            };

        self.release_operation_packet_id(&operation);
        self.apply_disconnect_completion(&operation)?;

        match &mut operation.options {
            None => {
                state_log!(self, info, "complete_operation_as_success - internal {} operation {} completed", mqtt_packet_to_str(&operation.packet), id);
                Ok(())
            }
            Some(options) => {
                state_log!(self, info, "complete_operation_as_success - user {} operation {} completed", mqtt_packet_to_str(&operation.packet), id);
                complete_operation_with_result(options, completion_result)
            }
        }
    }

    fn complete_operation_as_failure(&mut self, id : u64, error: SchistError) -> SchistResult<()> {
        let mut operation =
            match self.operations.remove(&id) {
                Some(operation) => { operation }
                None => {
                    // not fatal; the limits of the priority queue implementation used for timeouts
                    // can result in situations where we try to fail an operation that has already
                    // completed
                    state_log!(self, warn, "complete_operation_as_failure ({}) - operation id {} does not exist", error, id);
                    return Ok(())
                }
            };

        self.release_operation_packet_id(&operation);

        match &mut operation.options {
            None => {
                state_log!(self, info, "complete_operation_as_failure ({}) - internal {} operation {} completed", error, mqtt_packet_to_str(&operation.packet), id);
                Ok(())
            }
            Some(options) => {
                state_log!(self, info, "complete_operation_as_failure ({}) - user {} operation {} completed", error, mqtt_packet_to_str(&operation.packet), id);
                complete_operation_with_error(options, error)
            }
        }
    }

    fn complete_operation_sequence_as_failure<T>(&mut self, iterator: T, error_fn: fn() -> SchistError) -> SchistResult<()> where T : Iterator<Item = u64> {
        #[allow(clippy::manual_try_fold)]
        iterator.fold(
            Ok(()),
            |res, item| {
                fold_schist_result(res, self.complete_operation_as_failure(item, error_fn()))
            }
        )
    }

    fn complete_operation_sequence_as_empty_success<T>(&mut self, iterator: T) -> SchistResult<()> where T : Iterator<Item = u64> {
        #[allow(clippy::manual_try_fold)]
        iterator.fold(
            Ok(()),
            |res, item| {
                fold_schist_result(res, self.complete_operation_as_success(item, None))
            }
        )
    }

    fn handle_network_event_connection_opened(&mut self, establishment_timeout: Instant) -> SchistResult<()> {
        if self.state != ProtocolStateType::Disconnected {
            state_log!(self, error, "handle_network_event_connection_opened - called in invalid state");
            self.change_state(ProtocolStateType::Halted);
            return Err(SchistError::new_internal_state_error("connection opened in an invalid state"));
        }

        let connect =
            match &self.connection_config {
                Some(config) => { Box::new(MqttPacket::Connect(config.to_connect_packet())) }
                None => {
                    state_log!(self, error, "handle_network_event_connection_opened - no session has been started");
                    return Err(SchistError::new_internal_state_error("connection opened before a session was started"));
                }
            };

        state_log!(self, info, "handle_network_event_connection_opened");
        self.change_state(ProtocolStateType::PendingConnack);
        self.current_operation = None;
        self.pending_write_completion = false;
        self.decoder.reset_for_new_connection();

        // Queue up a Connect packet
        let connect_op_id = self.create_operation(connect, None);
        self.enqueue_operation(connect_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front);

        state_log!(self, debug, "handle_network_event_connection_opened - setting connack timeout to {} ms", self.get_elapsed_millis(&establishment_timeout));
        self.connack_timeout_timepoint = Some(establishment_timeout);

        Ok(())
    }

    fn is_pending_publish(&self, operation: &ClientOperation) -> bool {
        operation.packet_id.map_or(false, |packet_id| self.pending_publish_operations.contains_key(&packet_id))
    }

    fn apply_connection_closed_to_current_operation(&mut self) -> SchistResult<()> {
        if let Some(id) = self.current_operation.take() {
            if let Some(operation) = self.operations.get(&id) {
                let disposition =
                    match &*operation.packet {
                        MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                            InterruptedOperationDisposition::Requeue(ProtocolQueueType::User)
                        }
                        MqttPacket::Publish(_) | MqttPacket::Pubrel(_) if operation.is_awaiting_pubcomp() => {
                            // pubrels already tracked as pending publishes get requeued with that table
                            if self.is_pending_publish(operation) {
                                InterruptedOperationDisposition::Retain
                            } else {
                                InterruptedOperationDisposition::Requeue(ProtocolQueueType::Resubmit)
                            }
                        }
                        MqttPacket::Publish(publish) => {
                            if publish.duplicate {
                                InterruptedOperationDisposition::Requeue(ProtocolQueueType::Resubmit)
                            } else {
                                InterruptedOperationDisposition::Requeue(ProtocolQueueType::User)
                            }
                        }
                        _ => { InterruptedOperationDisposition::Fail }
                    };

                match disposition {
                    InterruptedOperationDisposition::Requeue(queue) => {
                        self.enqueue_operation(id, queue, ProtocolEnqueuePosition::Front);
                    }
                    InterruptedOperationDisposition::Retain => {}
                    InterruptedOperationDisposition::Fail => {
                        self.complete_operation_as_failure(id, generate_connection_lost_error())?;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_network_event_connection_closed(&mut self) -> SchistResult<()> {
        if self.state == ProtocolStateType::Disconnected {
            state_log!(self, error, "handle_network_event_connection_closed - called in invalid state");
            return Err(SchistError::new_internal_state_error("connection closed in an invalid state"));
        }

        state_log!(self, info, "handle_network_event_connection_closed");
        self.change_state(ProtocolStateType::Disconnected);
        self.connack_timeout_timepoint = None;
        self.keep_alive.stop();
        self.operation_ack_timeouts.clear();
        self.timed_out_packet_ids.clear();

        self.apply_connection_closed_to_current_operation()?;

        let mut result : SchistResult<()> = Ok(());

        /*
         * high priority operations are processed as follows:
         *
         *   connect, puback, pingreq, pubrec, pubcomp, disconnect can all be failed without
         *   consequence
         *
         *   pubrels are left alone but not requeued.  When the pending_publish table is
         *   processed a few lines further down, the associated operation will be added to the
         *   resubmit queue.
         */
        let completions = mem::take(&mut self.high_priority_operation_queue);
        let (_, failures) = self.partition_high_priority_queue_for_disconnect(completions.into_iter());

        result = fold_schist_result(result, self.complete_operation_sequence_as_failure(failures.into_iter(), generate_connection_lost_error));

        /*
         * operations waiting on a write completion never made it to the broker as far as we
         * know; qos 0 publishes are not retried
         */
        let completions = mem::take(&mut self.pending_write_completion_operations);
        result = fold_schist_result(result, self.complete_operation_sequence_as_failure(completions.into_iter(), generate_connection_lost_error));

        /*
         * qos1+ publishes and pubrels: mark as duplicate and add to end of resubmit queue
         */
        let unacked_publish_table = mem::take(&mut self.pending_publish_operations);
        unacked_publish_table.into_values().for_each(|id| {
            self.set_publish_duplicate_flag(id, true);
            self.resubmit_operation_queue.push_back(id);
        });

        /*
         * subscribe/unsubscribe to the user queue
         */
        let unacked_sub_unsub_table = mem::take(&mut self.pending_non_publish_operations);
        unacked_sub_unsub_table.into_values().for_each(|id| {
            self.user_operation_queue.push_front(id);
        });

        result
    }

    fn handle_network_event_write_completion(&mut self) -> SchistResult<()> {
        if self.state == ProtocolStateType::Halted || self.state == ProtocolStateType::Disconnected {
            state_log!(self, error, "handle_network_event_write_completion - called in invalid state");
            return Err(SchistError::new_internal_state_error("write completion in an invalid state"));
        }

        if !self.pending_write_completion {
            state_log!(self, error, "handle_network_event_write_completion - called with no pending completion");
            self.change_state(ProtocolStateType::Halted);

            return Err(SchistError::new_internal_state_error("write completion called with no pending completion"));
        }

        state_log!(self, debug, "handle_network_event - write completion");

        self.pending_write_completion = false;

        let completions = mem::take(&mut self.pending_write_completion_operations);
        self.complete_operation_sequence_as_empty_success(completions.into_iter())
    }

    fn change_state(&mut self, next_state: ProtocolStateType) {
        state_log!(self, debug, "change_state - transitioning from {} to {}", self.state, next_state);
        self.state = next_state;
    }

    fn is_connect_packet(&self, id: u64) -> bool {
        if let Some(operation) = self.operations.get(&id) {
            return operation.packet.packet_type() == PacketType::Connect;
        }

        false
    }

    fn is_connect_in_queue(&self) -> bool {
        self.high_priority_operation_queue.iter().any(|id| self.is_connect_packet(*id))
    }

    fn handle_network_event_incoming_data(&mut self, data: &[u8], packet_events: &mut VecDeque<PacketEvent>) -> SchistResult<()> {
        if self.state == ProtocolStateType::Disconnected || self.state == ProtocolStateType::Halted {
            state_log!(self, error, "handle_network_event_incoming_data - called in invalid state");
            return Err(SchistError::new_internal_state_error("incoming network data while in an invalid state"));
        }

        if self.state == ProtocolStateType::PendingConnack && self.is_connect_in_queue() {
            state_log!(self, error, "handle_network_event_incoming_data - data received before CONNECT sent");
            self.change_state(ProtocolStateType::Halted);
            return Err(SchistError::new_protocol_error("data received before CONNECT sent"));
        }

        state_log!(self, debug, "handle_network_event_incoming_data received {} bytes", data.len());
        let mut decoded_packets = VecDeque::new();
        let mut decode_context = DecodingContext {
            maximum_packet_size: MAXIMUM_VARIABLE_LENGTH_INTEGER as u32,
            decoded_packets: &mut decoded_packets
        };

        let decode_result = self.decoder.decode_bytes(data, &mut decode_context);
        if decode_result.is_err() {
            state_log!(self, error, "handle_network_event_incoming_data - decode failure");
            self.change_state(ProtocolStateType::Halted);
            return decode_result;
        }

        for packet in decoded_packets {
            let handler_result = self.handle_packet(packet, packet_events);
            if handler_result.is_err() {
                state_log!(self, error, "handle_network_event_incoming_data - packet handling failure");
                self.change_state(ProtocolStateType::Halted);
                return handler_result;
            }
        }

        Ok(())
    }

    fn dequeue_operation(&mut self, mode: ProtocolQueueServiceMode) -> Option<u64> {
        if self.pending_write_completion {
            return None;
        }

        if let Some(id) = self.high_priority_operation_queue.pop_front() {
            return Some(id);
        }

        if mode != ProtocolQueueServiceMode::HighPriorityOnly {
            if let Some(id) = self.resubmit_operation_queue.pop_front() {
                return Some(id);
            }

            if let Some(id) = self.user_operation_queue.pop_front() {
                return Some(id);
            }
        }

        None
    }

    fn get_next_ack_timeout(&mut self) -> Option<u64> {
        if let Some(reverse_record) = self.operation_ack_timeouts.peek() {
            let record = &reverse_record.0;
            if record.timeout <= self.current_time {
                return Some(record.id);
            }
        }

        None
    }

    fn process_ack_timeouts(&mut self) -> SchistResult<()> {
        let mut result = Ok(());

        while let Some(id) = self.get_next_ack_timeout() {
            self.operation_ack_timeouts.pop();
            if let Some(packet_id) = self.operations.get(&id).and_then(|operation| operation.packet_id) {
                self.timed_out_packet_ids.insert(packet_id);
            }
            result = fold_schist_result(result, self.complete_operation_as_failure(id, SchistError::new_ack_timeout()));
        }

        result
    }

    fn is_late_ack(&mut self, packet_id: u16, packet_name: &str) -> bool {
        if self.timed_out_packet_ids.remove(&packet_id) {
            state_log!(self, warn, "{} with packet id {} arrived after its operation timed out; ignoring", packet_name, packet_id);
            return true;
        }

        false
    }

    fn get_operation_timeout_duration(&self, operation: &ClientOperation) -> Option<Duration> {
        match &operation.options {
            Some(ClientOperationOptions::Unsubscribe(unsubscribe_options)) => {
                unsubscribe_options.options.ack_timeout
            }
            Some(ClientOperationOptions::Subscribe(subscribe_options)) => {
                subscribe_options.options.ack_timeout
            }
            Some(ClientOperationOptions::Publish(publish_options)) => {
                publish_options.options.ack_timeout
            }
            None => { None }
        }
    }

    fn start_operation_ack_timeout(&mut self, id: u64, now: Instant) {
        let timeout_duration_option = self.operations.get(&id).and_then(|operation| self.get_operation_timeout_duration(operation));

        if let Some(timeout_duration) = timeout_duration_option {
            let timeout_record = OperationTimeoutRecord {
                id,
                timeout: now + timeout_duration
            };

            self.operation_ack_timeouts.push(Reverse(timeout_record));
        }
    }

    fn on_current_operation_fully_written(&mut self, now: Instant) -> SchistResult<()> {
        let id =
            match self.current_operation.take() {
                Some(id) => { id }
                None => {
                    return Err(SchistError::new_internal_state_error("no current operation to complete writing"));
                }
            };

        let operation =
            match self.operations.get(&id) {
                Some(operation) => { operation }
                None => {
                    return Err(SchistError::new_internal_state_error("fully written operation does not exist"));
                }
            };

        match operation.outbound_packet() {
            MqttPacket::Subscribe(subscribe) => {
                self.pending_non_publish_operations.insert(subscribe.packet_id, id);
                self.session.outbound.insert(subscribe.packet_id, InFlightExchange::new(subscribe.packet_id, ExchangeRole::Publisher, ExchangeStage::AwaitingSubAck, operation.outbound_packet().clone()));
                self.session_dirty = true;
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                self.pending_non_publish_operations.insert(unsubscribe.packet_id, id);
                self.session.outbound.insert(unsubscribe.packet_id, InFlightExchange::new(unsubscribe.packet_id, ExchangeRole::Publisher, ExchangeStage::AwaitingUnsubAck, operation.outbound_packet().clone()));
                self.session_dirty = true;
            }
            MqttPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtMostOnce {
                    self.pending_write_completion_operations.push_back(id);
                } else {
                    self.pending_publish_operations.insert(publish.packet_id, id);

                    let stage =
                        if publish.qos == QualityOfService::AtLeastOnce {
                            ExchangeStage::AwaitingPubAck
                        } else {
                            ExchangeStage::AwaitingPubRec
                        };

                    if let btree_map::Entry::Vacant(entry) = self.session.outbound.entry(publish.packet_id) {
                        entry.insert(InFlightExchange::new(publish.packet_id, ExchangeRole::Publisher, stage, operation.outbound_packet().clone()));
                        self.session_dirty = true;
                    }
                }
            }
            MqttPacket::Pubrel(pubrel) => {
                self.pending_publish_operations.insert(pubrel.packet_id, id);
            }
            MqttPacket::Disconnect(_) => {
                self.state = ProtocolStateType::PendingDisconnect;
                self.pending_write_completion_operations.push_back(id);
            }
            _ => {
                self.pending_write_completion_operations.push_back(id);
            }
        }

        self.keep_alive.on_packet_sent(now);
        self.start_operation_ack_timeout(id, now);

        Ok(())
    }

    fn service_disconnected(&mut self, _: &mut ServiceContext) -> SchistResult<()> {
        state_log!(self, debug, "service_disconnected");
        Ok(())
    }

    fn service_queue_aux(&mut self, context: &mut ServiceContext, mode: ProtocolQueueServiceMode) -> SchistResult<()> {
        while self.state == ProtocolStateType::PendingConnack || self.state == ProtocolStateType::Connected {
            let current_operation_id =
                match self.current_operation {
                    Some(id) => { id }
                    None => {
                        let id =
                            match self.dequeue_operation(mode) {
                                Some(id) => { id }
                                None => {
                                    state_log!(self, debug, "service_queue - no operations ready for processing");
                                    return Ok(())
                                }
                            };

                        state_log!(self, debug, "service_queue - operation {} dequeued for processing", id);
                        if !self.operations.contains_key(&id) {
                            state_log!(self, warn, "service_queue - operation {} does not exist", id);
                            continue;
                        }

                        self.current_operation = Some(id);
                        self.acquire_packet_id_for_operation(id)?;

                        if let Some(operation) = self.operations.get(&id) {
                            state_log!(self, debug, "service_queue - operation {} submitted to encoder for setup", id);
                            self.encoder.reset(operation.outbound_packet())?;
                        }

                        id
                    }
                };

            let operation =
                match self.operations.get(&current_operation_id) {
                    Some(operation) => { operation }
                    None => {
                        state_log!(self, error, "service_queue - operation {} vanished while being encoded", current_operation_id);
                        return Err(SchistError::new_internal_state_error("current operation no longer exists"));
                    }
                };

            let encode_result = self.encoder.encode(operation.outbound_packet(), context.to_socket)?;
            if encode_result == EncodeResult::Complete {
                state_log!(self, debug, "service_queue - operation {} encoding complete", current_operation_id);
                self.on_current_operation_fully_written(context.current_time)?;
            } else {
                state_log!(self, debug, "service_queue - operation {} encoding still in progress", current_operation_id);
                return Ok(())
            }
        }

        Ok(())
    }

    fn service_queue(&mut self, context: &mut ServiceContext, mode: ProtocolQueueServiceMode) -> SchistResult<()> {
        let to_socket_length = context.to_socket.len();

        let result = self.service_queue_aux(context, mode);

        if context.to_socket.len() != to_socket_length {
            self.pending_write_completion = true;
        }

        result
    }

    fn service_pending_connack(&mut self, context: &mut ServiceContext) -> SchistResult<()> {
        state_log!(self, debug, "service_pending_connack");

        if let Some(connack_timeout) = self.connack_timeout_timepoint {
            if context.current_time >= connack_timeout {
                state_log!(self, error, "service_pending_connack - connack timeout exceeded");
                return Err(SchistError::new_connection_establishment_failure("connack response timeout reached"));
            }
        }

        self.service_queue(context, ProtocolQueueServiceMode::HighPriorityOnly)?;

        Ok(())
    }

    fn service_keep_alive(&mut self, context: &mut ServiceContext) -> SchistResult<()> {
        self.keep_alive.check_ping_timeout(context.current_time)?;

        if self.keep_alive.should_send_ping(context.current_time) {
            state_log!(self, debug, "service_keep_alive - next ping time reached, sending ping");
            let ping = Box::new(MqttPacket::Pingreq(PingreqPacket{}));
            let ping_op_id = self.create_operation(ping, None);

            self.enqueue_operation(ping_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front);
        }

        Ok(())
    }

    fn service_connected(&mut self, context: &mut ServiceContext) -> SchistResult<()> {
        state_log!(self, debug, "service_connected");

        self.service_keep_alive(context)?;
        self.service_queue(context, ProtocolQueueServiceMode::All)?;
        self.process_ack_timeouts()?;

        Ok(())
    }

    fn service_pending_disconnect(&mut self, _: &mut ServiceContext) -> SchistResult<()> {
        state_log!(self, debug, "service_pending_disconnect");

        self.process_ack_timeouts()?;

        Ok(())
    }

    fn get_next_service_timepoint_protocol_queue(&self, mode: ProtocolQueueServiceMode) -> Option<Instant> {
        if self.pending_write_completion {
            return None;
        }

        if !self.high_priority_operation_queue.is_empty() {
            return Some(self.current_time);
        }

        if mode == ProtocolQueueServiceMode::All && (!self.resubmit_operation_queue.is_empty() || !self.user_operation_queue.is_empty()) {
            return Some(self.current_time);
        }

        None
    }

    fn get_next_service_timepoint_disconnected(&self) -> Option<Instant> {
        None
    }

    fn get_next_service_timepoint_pending_connack(&self) -> Option<Instant> {
        fold_optional_timepoint_min(&self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::HighPriorityOnly), &self.connack_timeout_timepoint)
    }

    fn get_next_service_timepoint_connected(&self) -> Option<Instant> {
        let mut next_service_time: Option<Instant> = None;
        if self.keep_alive.is_ping_outstanding() {
            next_service_time = self.keep_alive.next_service_timepoint();
        }

        if let Some(ack_timeout) = self.operation_ack_timeouts.peek() {
            next_service_time = fold_timepoint(&next_service_time, &ack_timeout.0.timeout);
        }

        if self.pending_write_completion {
            return next_service_time;
        }

        next_service_time = fold_optional_timepoint_min(&next_service_time, &self.keep_alive.next_service_timepoint());

        fold_optional_timepoint_min(&self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::All), &next_service_time)
    }

    fn get_next_service_timepoint_pending_disconnect(&self) -> Option<Instant> {
        let mut next_service_time = self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::HighPriorityOnly);

        if let Some(ack_timeout) = self.operation_ack_timeouts.peek() {
            next_service_time = fold_timepoint(&next_service_time, &ack_timeout.0.timeout);
        }

        next_service_time
    }

    fn set_publish_duplicate_flag(&mut self, id: u64, value: bool) {
        if let Some(operation) = self.operations.get_mut(&id) {
            if let MqttPacket::Publish(publish) = &mut *operation.packet {
                state_log!(self, debug, "set_publish_duplicate_flag - setting publish operation {} duplicate field to {}", id, value);
                publish.duplicate = value;
            }
        }
    }

    // Builds one internal subscribe covering every subscription the session knows about and puts
    // it at the head of the user queue.  Any previous resubscribe that never completed is dropped.
    fn queue_resubscribe(&mut self) {
        if let Some(previous_id) = self.resubscribe_operation.take() {
            if self.operations.contains_key(&previous_id) {
                state_log!(self, debug, "queue_resubscribe - replacing unfinished resubscribe operation {}", previous_id);
                let _ = self.complete_operation_as_failure(previous_id, generate_connection_lost_error());
                self.user_operation_queue.retain(|id| *id != previous_id);
            }
        }

        if self.session.subscriptions.is_empty() {
            return;
        }

        let mut subscriptions : Vec<Subscription> = self.session.subscriptions.iter().map(|(filter, qos)| {
            Subscription::new(filter, *qos)
        }).collect();
        subscriptions.sort_by(|lhs, rhs| lhs.topic_filter.cmp(&rhs.topic_filter));

        state_log!(self, info, "queue_resubscribe - restoring {} subscriptions", subscriptions.len());

        let subscribe = Box::new(MqttPacket::Subscribe(SubscribePacket {
            packet_id: 0,
            subscriptions,
        }));

        let resubscribe_id = self.create_operation(subscribe, None);
        self.enqueue_operation(resubscribe_id, ProtocolQueueType::User, ProtocolEnqueuePosition::Front);
        self.resubscribe_operation = Some(resubscribe_id);
    }

    fn apply_session_present_to_connection(&mut self, session_present: bool) {
        // re-establish submission order after all the shuffling
        sort_operation_deque(&mut self.resubmit_operation_queue);
        sort_operation_deque(&mut self.user_operation_queue);

        if session_present {
            state_log!(self, info, "apply_session_present_to_connection - successfully rejoined a session");
            return;
        }

        state_log!(self, info, "apply_session_present_to_connection - no session present");
        if !self.session.inbound.is_empty() {
            state_log!(self, warn, "apply_session_present_to_connection - broker lost session; dropping {} unreleased incoming QoS 2 publishes", self.session.inbound.len());
            self.session.inbound.clear();
            self.session_dirty = true;
        }

        self.queue_resubscribe();
    }

    fn handle_connack(&mut self, packet: Box<MqttPacket>, packet_events: &mut VecDeque<PacketEvent>) -> SchistResult<()> {
        if let MqttPacket::Connack(connack) = *packet {
            state_log!(self, info, "handle_connack - processing CONNACK packet");

            if self.state != ProtocolStateType::PendingConnack {
                state_log!(self, error, "handle_connack - invalid state to receive a connack");
                return Err(SchistError::new_protocol_error("invalid state for connack receipt"));
            }

            if !connack.return_code.is_success() {
                state_log!(self, error, "handle_connack - connection rejected with return code {}", connack.return_code);
                return Err(SchistError::new_connection_rejected(connack.return_code));
            }

            if connack.session_present && self.session.clean_start {
                state_log!(self, error, "handle_connack - session present on a clean start connection");
                return Err(SchistError::new_protocol_error("connack reported a session for a clean start connection"));
            }

            self.change_state(ProtocolStateType::Connected);
            self.connack_timeout_timepoint = None;
            self.keep_alive.start(self.current_time);

            self.apply_session_present_to_connection(connack.session_present);

            packet_events.push_back(PacketEvent::Connack(connack));

            return Ok(());
        }

        Err(SchistError::new_internal_state_error("handle_connack - invalid input"))
    }

    fn handle_pingresp(&mut self) -> SchistResult<()> {
        state_log!(self, info, "handle_pingresp - processing PINGRESP packet");
        match self.state {
            ProtocolStateType::Connected | ProtocolStateType::PendingDisconnect => {
                self.keep_alive.on_pingresp()
            }
            _ => {
                state_log!(self, error, "handle_pingresp - invalid state to receive a PINGRESP");
                Err(SchistError::new_protocol_error("invalid state to receive a pingresp"))
            }
        }
    }

    fn check_connected_for_receipt(&self, packet_name: &str) -> SchistResult<()> {
        match self.state {
            ProtocolStateType::Disconnected | ProtocolStateType::PendingConnack => {
                state_log!(self, error, "handle_{} - invalid state to receive a {}", packet_name, packet_name.to_uppercase());
                Err(SchistError::new_protocol_error(format!("invalid state to receive a {}", packet_name)))
            }
            _ => { Ok(()) }
        }
    }

    fn apply_suback_to_session(&mut self, operation_id: u64, suback: &SubackPacket) -> SchistResult<()> {
        if let Some(operation) = self.operations.get(&operation_id) {
            if let MqttPacket::Subscribe(subscribe) = &*operation.packet {
                if subscribe.subscriptions.len() != suback.return_codes.len() {
                    state_log!(self, error, "handle_suback - SUBACK carries {} return codes for {} subscriptions", suback.return_codes.len(), subscribe.subscriptions.len());
                    return Err(SchistError::new_protocol_error("suback return code count does not match subscription count"));
                }

                for (subscription, return_code) in subscribe.subscriptions.iter().zip(suback.return_codes.iter()) {
                    if return_code.is_success() {
                        self.session.subscriptions.insert(subscription.topic_filter.clone(), subscription.qos);
                    } else {
                        state_log!(self, warn, "handle_suback - subscription to \"{}\" rejected", subscription.topic_filter);
                        self.session.subscriptions.remove(&subscription.topic_filter);
                    }
                }

                self.session_dirty = true;
            }
        }

        Ok(())
    }

    fn handle_suback(&mut self, packet: Box<MqttPacket>) -> SchistResult<()> {
        state_log!(self, info, "handle_suback - processing SUBACK packet");
        self.check_connected_for_receipt("suback")?;

        if let MqttPacket::Suback(suback) = *packet {
            let packet_id = suback.packet_id;
            if let Some(operation_id) = self.pending_non_publish_operations.get(&packet_id).copied() {
                self.apply_suback_to_session(operation_id, &suback)?;
                if self.resubscribe_operation == Some(operation_id) {
                    self.resubscribe_operation = None;
                }

                return self.complete_operation_as_success(operation_id, Some(OperationResponse::Subscribe(suback)));
            }

            if self.is_late_ack(packet_id, "SUBACK") {
                return Ok(());
            }

            state_log!(self, error, "handle_suback - no matching operation corresponding to SUBACK packet id {}", packet_id);
            return Err(SchistError::new_protocol_error("no pending subscribe exists for incoming suback"));
        }

        Err(SchistError::new_internal_state_error("handle_suback - invalid input"))
    }

    fn handle_unsuback(&mut self, packet: Box<MqttPacket>) -> SchistResult<()> {
        state_log!(self, info, "handle_unsuback - processing UNSUBACK packet");
        self.check_connected_for_receipt("unsuback")?;

        if let MqttPacket::Unsuback(unsuback) = *packet {
            let packet_id = unsuback.packet_id;
            if let Some(operation_id) = self.pending_non_publish_operations.get(&packet_id).copied() {
                if let Some(operation) = self.operations.get(&operation_id) {
                    if let MqttPacket::Unsubscribe(unsubscribe) = &*operation.packet {
                        for topic_filter in &unsubscribe.topic_filters {
                            self.session.subscriptions.remove(topic_filter);
                        }
                        self.session_dirty = true;
                    }
                }

                return self.complete_operation_as_success(operation_id, Some(OperationResponse::Unsubscribe(unsuback)));
            }

            if self.is_late_ack(packet_id, "UNSUBACK") {
                return Ok(());
            }

            state_log!(self, error, "handle_unsuback - no matching operation corresponding to UNSUBACK packet id {}", packet_id);
            return Err(SchistError::new_protocol_error("no pending unsubscribe exists for incoming unsuback"));
        }

        Err(SchistError::new_internal_state_error("handle_unsuback - invalid input"))
    }

    fn handle_puback(&mut self, packet: Box<MqttPacket>) -> SchistResult<()> {
        state_log!(self, info, "handle_puback - processing PUBACK packet");
        self.check_connected_for_receipt("puback")?;

        if let MqttPacket::Puback(puback) = *packet {
            let packet_id = puback.packet_id;
            if let Some(operation_id) = self.pending_publish_operations.get(&packet_id).copied() {
                if let Some(operation) = self.operations.get(&operation_id) {
                    let is_qos1_publish = matches!(&*operation.packet, MqttPacket::Publish(publish) if publish.qos == QualityOfService::AtLeastOnce);
                    if !is_qos1_publish {
                        state_log!(self, error, "handle_puback - operation {} corresponding to packet id {} is not a QoS 1 publish", operation_id, packet_id);
                        return Err(SchistError::new_protocol_error("puback received for a pending operation that is not a qos1 publish"));
                    }
                }

                return self.complete_operation_as_success(operation_id, Some(OperationResponse::Publish(PublishResponse::Qos1(puback))));
            }

            if self.is_late_ack(packet_id, "PUBACK") {
                return Ok(());
            }

            state_log!(self, error, "handle_puback - no matching operation corresponding to PUBACK packet id {}", packet_id);
            return Err(SchistError::new_protocol_error("no pending qos1 publish exists for incoming puback"));
        }

        Err(SchistError::new_internal_state_error("handle_puback - invalid input"))
    }

    fn handle_pubrec(&mut self, packet: Box<MqttPacket>) -> SchistResult<()> {
        state_log!(self, info, "handle_pubrec - processing PUBREC packet");
        self.check_connected_for_receipt("pubrec")?;

        if let MqttPacket::Pubrec(pubrec) = *packet {
            let packet_id = pubrec.packet_id;
            let operation_id =
                match self.pending_publish_operations.get(&packet_id).copied() {
                    Some(operation_id) => { operation_id }
                    None => {
                        if self.is_late_ack(packet_id, "PUBREC") {
                            return Ok(());
                        }

                        state_log!(self, error, "handle_pubrec - no matching operation corresponding to PUBREC packet id {}", packet_id);
                        return Err(SchistError::new_protocol_error("no pending operation exists for incoming pubrec"));
                    }
                };

            let operation =
                match self.operations.get_mut(&operation_id) {
                    Some(operation) => { operation }
                    None => {
                        state_log!(self, warn, "handle_pubrec - operation {} corresponding to packet id {} does not exist", operation_id, packet_id);
                        return Ok(());
                    }
                };

            if operation.is_awaiting_pubcomp() {
                state_log!(self, debug, "handle_pubrec - ignoring duplicate PUBREC for packet id {}", packet_id);
                return Ok(());
            }

            let is_qos2_publish = matches!(&*operation.packet, MqttPacket::Publish(publish) if publish.qos == QualityOfService::ExactlyOnce);
            if !is_qos2_publish {
                state_log!(self, error, "handle_pubrec - operation {} corresponding to packet id {} is not a QoS 2 publish", operation_id, packet_id);
                return Err(SchistError::new_protocol_error("pubrec received for a pending operation that is not a qos2 publish"));
            }

            let pubrel = MqttPacket::Pubrel(PubrelPacket {
                packet_id,
            });
            operation.qos2_pubrel = Some(Box::new(pubrel.clone()));

            if let Some(exchange) = self.session.outbound.get_mut(&packet_id) {
                if exchange.stage == ExchangeStage::AwaitingPubRec {
                    exchange.stage = ExchangeStage::AwaitingPubComp;
                    exchange.packet = pubrel;
                    self.session_dirty = true;
                }
            }

            self.enqueue_operation(operation_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);
            return Ok(());
        }

        Err(SchistError::new_internal_state_error("handle_pubrec - invalid input"))
    }

    fn handle_pubrel(&mut self, packet: Box<MqttPacket>, packet_events: &mut VecDeque<PacketEvent>) -> SchistResult<()> {
        state_log!(self, info, "handle_pubrel - processing PUBREL packet");
        self.check_connected_for_receipt("pubrel")?;

        if let MqttPacket::Pubrel(pubrel) = &*packet {
            let packet_id = pubrel.packet_id;
            match self.session.inbound.remove(&packet_id) {
                Some(exchange) => {
                    self.session_dirty = true;
                    if let MqttPacket::Publish(publish) = exchange.packet {
                        state_log!(self, debug, "handle_pubrel - releasing QoS 2 publish with packet id {}", packet_id);
                        packet_events.push_back(PacketEvent::Publish(publish));
                    }
                }
                None => {
                    state_log!(self, warn, "handle_pubrel - no unreleased publish with packet id {}; completing anyway", packet_id);
                }
            }

            let pubcomp = Box::new(MqttPacket::Pubcomp(PubcompPacket{
                packet_id,
            }));
            let pubcomp_op_id = self.create_operation(pubcomp, None);

            self.enqueue_operation(pubcomp_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);

            return Ok(());
        }

        Err(SchistError::new_internal_state_error("handle_pubrel - invalid input"))
    }

    fn handle_pubcomp(&mut self, packet: Box<MqttPacket>) -> SchistResult<()> {
        state_log!(self, info, "handle_pubcomp - processing PUBCOMP packet");
        self.check_connected_for_receipt("pubcomp")?;

        if let MqttPacket::Pubcomp(pubcomp) = *packet {
            let packet_id = pubcomp.packet_id;
            if let Some(operation_id) = self.pending_publish_operations.get(&packet_id).copied() {
                if let Some(operation) = self.operations.get(&operation_id) {
                    if !operation.is_awaiting_pubcomp() {
                        state_log!(self, error, "handle_pubcomp - operation {} corresponding to packet id {} has not been released", operation_id, packet_id);
                        return Err(SchistError::new_protocol_error("pubcomp received before pubrec"));
                    }
                }

                return self.complete_operation_as_success(operation_id, Some(OperationResponse::Publish(PublishResponse::Qos2(pubcomp))));
            }

            if self.is_late_ack(packet_id, "PUBCOMP") {
                return Ok(());
            }

            state_log!(self, error, "handle_pubcomp - no matching operation corresponding to PUBCOMP packet id {}", packet_id);
            return Err(SchistError::new_protocol_error("no pending operation exists for incoming pubcomp"));
        }

        Err(SchistError::new_internal_state_error("handle_pubcomp - invalid input"))
    }

    fn handle_publish(&mut self, packet: Box<MqttPacket>, packet_events: &mut VecDeque<PacketEvent>) -> SchistResult<()> {
        state_log!(self, info, "handle_publish - processing PUBLISH packet");
        self.check_connected_for_receipt("publish")?;

        if let MqttPacket::Publish(publish) = *packet {
            if !self.session.subscriptions.keys().any(|filter| topic_matches_filter(&publish.topic, filter)) {
                state_log!(self, debug, "handle_publish - topic \"{}\" matches no known subscription", publish.topic);
            }

            let packet_id = publish.packet_id;
            match publish.qos {
                QualityOfService::AtMostOnce => {
                    packet_events.push_back(PacketEvent::Publish(publish));
                }

                QualityOfService::AtLeastOnce => {
                    packet_events.push_back(PacketEvent::Publish(publish));

                    let puback = Box::new(MqttPacket::Puback(PubackPacket{
                        packet_id,
                    }));
                    let puback_op_id = self.create_operation(puback, None);

                    self.enqueue_operation(puback_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);
                }

                QualityOfService::ExactlyOnce => {
                    if let btree_map::Entry::Vacant(entry) = self.session.inbound.entry(packet_id) {
                        entry.insert(InFlightExchange::new(packet_id, ExchangeRole::Receiver, ExchangeStage::AwaitingPubRel, MqttPacket::Publish(publish)));
                        self.session_dirty = true;
                    } else {
                        state_log!(self, debug, "handle_publish - QoS 2 publish with packet id {} already received; acknowledging again", packet_id);
                    }

                    let pubrec = Box::new(MqttPacket::Pubrec(PubrecPacket{
                        packet_id,
                    }));
                    let pubrec_op_id = self.create_operation(pubrec, None);

                    self.enqueue_operation(pubrec_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);
                }
            }

            return Ok(());
        }

        Err(SchistError::new_internal_state_error("handle_publish - invalid input"))
    }

    fn handle_packet(&mut self, packet: Box<MqttPacket>, packet_events: &mut VecDeque<PacketEvent>) -> SchistResult<()> {
        match &*packet {
            MqttPacket::Connack(_) => { self.handle_connack(packet, packet_events) }
            MqttPacket::Publish(_) => { self.handle_publish(packet, packet_events) }
            MqttPacket::Pingresp(_) => { self.handle_pingresp() }
            MqttPacket::Suback(_) => { self.handle_suback(packet) }
            MqttPacket::Unsuback(_) => { self.handle_unsuback(packet) }
            MqttPacket::Puback(_) => { self.handle_puback(packet) }
            MqttPacket::Pubcomp(_) => { self.handle_pubcomp(packet) }
            MqttPacket::Pubrel(_) => { self.handle_pubrel(packet, packet_events) }
            MqttPacket::Pubrec(_) => { self.handle_pubrec(packet) }
            MqttPacket::Disconnect(_) => {
                state_log!(self, error, "handle_packet - MQTT311 forbids server-side disconnects");
                Err(SchistError::new_protocol_error("MQTT311 forbids server-side disconnects"))
            }
            _ => {
                state_log!(self, error, "handle_packet - invalid packet type for client received: {}", mqtt_packet_to_str(&packet));
                Err(SchistError::new_protocol_error("invalid packet type received"))
            }
        }
    }

    fn get_queue(&mut self, queue_type: ProtocolQueueType) -> &mut VecDeque<u64> {
        match queue_type {
            ProtocolQueueType::User => { &mut self.user_operation_queue }
            ProtocolQueueType::Resubmit => { &mut self.resubmit_operation_queue }
            ProtocolQueueType::HighPriority => { &mut self.high_priority_operation_queue }
        }
    }

    fn enqueue_operation(&mut self, id: u64, queue_type: ProtocolQueueType, position: ProtocolEnqueuePosition) {
        if !self.operations.contains_key(&id) {
            state_log!(self, error, "enqueue_operation - operation {} does not exist", id);
            return;
        }

        state_log!(self, debug, "enqueue_operation - operation {} added at {:?} of {:?} queue", id, position, queue_type);
        let queue = self.get_queue(queue_type);
        match position {
            ProtocolEnqueuePosition::Front => { queue.push_front(id); }
            ProtocolEnqueuePosition::Back => { queue.push_back(id); }
        }
    }

    fn create_operation(&mut self, packet: Box<MqttPacket>, options: Option<ClientOperationOptions>) -> u64 {
        let id = self.next_operation_id;
        self.next_operation_id += 1;

        state_log!(self, info, "create_operation - building {} operation with id {}", mqtt_packet_to_str(&packet), id);
        state_log!(self, debug, "create_operation - operation {}: {}", id, &packet);

        let operation = ClientOperation {
            id,
            packet,
            qos2_pubrel: None,
            packet_id: None,
            options,
        };

        self.operations.insert(id, operation);

        id
    }

    fn acquire_free_packet_id(&mut self, operation_id: u64) -> SchistResult<u16> {
        let start_id = self.next_packet_id;
        let mut check_id = start_id;

        loop {
            if self.next_packet_id == u16::MAX {
                self.next_packet_id = 1;
            } else {
                self.next_packet_id += 1;
            }

            if let hash_map::Entry::Vacant(e) = self.allocated_packet_ids.entry(check_id) {
                e.insert(operation_id);
                self.timed_out_packet_ids.remove(&check_id);
                return Ok(check_id);
            }

            if self.next_packet_id == start_id {
                state_log!(self, error, "acquire_packet_id_for_operation - operation {} could not find an unbound packet id", operation_id);
                return Err(SchistError::new_internal_state_error("packet id space exhausted"));
            }

            check_id = self.next_packet_id;
        }
    }

    fn bind_operation_packet_id(&mut self, operation_id: u64, packet_id: u16) -> SchistResult<()> {
        if let Some(existing_id) = self.allocated_packet_ids.get(&packet_id) {
            if *existing_id != operation_id {
                return Err(SchistError::new_internal_state_error("packet id already bound to another operation"));
            }
        }

        match self.operations.get_mut(&operation_id) {
            Some(operation) => {
                operation.bind_packet_id(packet_id)?;
                self.allocated_packet_ids.insert(packet_id, operation_id);
                self.timed_out_packet_ids.remove(&packet_id);
                Ok(())
            }
            None => {
                Err(SchistError::new_internal_state_error("cannot bind a packet id to an operation that does not exist"))
            }
        }
    }

    fn acquire_packet_id_for_operation(&mut self, operation_id: u64) -> SchistResult<()> {
        let operation =
            match self.operations.get(&operation_id) {
                Some(operation) => { operation }
                None => {
                    return Err(SchistError::new_internal_state_error("cannot acquire a packet id for an operation that does not exist"));
                }
            };

        if let Some(packet_id) = operation.packet_id {
            state_log!(self, debug, "acquire_packet_id_for_operation - operation {} reusing existing packet id binding: {}", operation_id, packet_id);
            return Ok(());
        }

        match &*operation.packet {
            MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => { }
            MqttPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtMostOnce {
                    return Ok(());
                }
            }
            _ => { return Ok(()); }
        }

        let packet_id = self.acquire_free_packet_id(operation_id)?;
        self.bind_operation_packet_id(operation_id, packet_id)
    }
}

fn generate_connection_lost_error() -> SchistError {
    SchistError::new_connection_lost("operation failed due to connection close event")
}

fn generate_session_discarded_error() -> SchistError {
    SchistError::new_other_error("in-flight exchange discarded by a new session")
}

fn complete_operation_with_result(operation_options: &mut ClientOperationOptions, completion_result: Option<OperationResponse>) -> SchistResult<()> {
    match (operation_options, completion_result) {
        (ClientOperationOptions::Publish(publish_options), None) => {
            if let Some(handler) = publish_options.response_handler.take() {
                let _ = handler(Ok(PublishResponse::Qos0));
            }
        }
        (ClientOperationOptions::Publish(publish_options), Some(OperationResponse::Publish(publish_response))) => {
            if let Some(handler) = publish_options.response_handler.take() {
                let _ = handler(Ok(publish_response));
            }
        }
        (ClientOperationOptions::Subscribe(subscribe_options), Some(OperationResponse::Subscribe(suback))) => {
            if let Some(handler) = subscribe_options.response_handler.take() {
                let _ = handler(Ok(suback));
            }
        }
        (ClientOperationOptions::Unsubscribe(unsubscribe_options), Some(OperationResponse::Unsubscribe(unsuback))) => {
            if let Some(handler) = unsubscribe_options.response_handler.take() {
                let _ = handler(Ok(unsuback));
            }
        }
        _ => {
            return Err(SchistError::new_internal_state_error("operation result does not match operation type"));
        }
    }

    Ok(())
}

fn complete_operation_with_error(operation_options: &mut ClientOperationOptions, error: SchistError) -> SchistResult<()> {
    match operation_options {
        ClientOperationOptions::Publish(publish_options) => {
            if let Some(handler) = publish_options.response_handler.take() {
                let _ = handler(Err(error));
            }
        }
        ClientOperationOptions::Subscribe(subscribe_options) => {
            if let Some(handler) = subscribe_options.response_handler.take() {
                let _ = handler(Err(error));
            }
        }
        ClientOperationOptions::Unsubscribe(unsubscribe_options) => {
            if let Some(handler) = unsubscribe_options.response_handler.take() {
                let _ = handler(Err(error));
            }
        }
    }

    Ok(())
}

fn sort_operation_deque(operations: &mut VecDeque<u64>) {
    operations.make_contiguous().sort();
}

fn fold_timepoint(base: &Option<Instant>, new: &Instant) -> Option<Instant> {
    if let Some(base_timepoint) = &base {
        if base_timepoint < new {
            return *base;
        }
    }

    Some(*new)
}

fn fold_optional_timepoint_min(base: &Option<Instant>, new: &Option<Instant>) -> Option<Instant> {
    if let Some(base_timepoint) = base {
        if let Some(new_timepoint) = new {
            if base_timepoint < new_timepoint {
                return *base;
            } else {
                return *new;
            }
        }

        return *base;
    }

    *new
}
