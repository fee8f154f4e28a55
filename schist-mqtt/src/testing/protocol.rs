/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use crate::protocol::*;
use assert_matches::assert_matches;
use crate::client::*;
use crate::config::*;
use crate::decode::{Decoder, DecodingContext};
use crate::decode::testing::encode_packet_for_test;
use crate::encode::{Encoder, EncodeResult};
use crate::encode::utils::MAXIMUM_VARIABLE_LENGTH_INTEGER;
use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;
use crate::session::*;

const CONNACK_TIMEOUT_MILLIS: u64 = 10000;

const CLIENT_ID: &str = "DefaultTesting";

fn build_connection_config(clean_start: bool, keep_alive_seconds: u16) -> ConnectionConfig {
    ConnectionConfigBuilder::new_from_uri("mqtt://localhost:1883").unwrap()
        .with_client_id(CLIENT_ID)
        .with_clean_start(clean_start)
        .with_keep_alive_seconds(keep_alive_seconds)
        .build()
}

fn build_standard_test_config() -> ProtocolStateConfig {
    build_test_config_with_store(InMemorySessionStore::new())
}

fn build_test_config_with_store(session_store: InMemorySessionStore) -> ProtocolStateConfig {
    ProtocolStateConfig {
        base_timestamp: Instant::now(),
        session_store: Box::new(session_store),
    }
}

#[derive(Default)]
pub(crate) struct BrokerTestContext {
    pub(crate) connect_count: usize,
}

pub(crate) type PacketHandler = Box<dyn Fn(&MqttPacket, &mut VecDeque<Box<MqttPacket>>, &mut BrokerTestContext) -> SchistResult<()> + Send + Sync + 'static>;
pub(crate) type PacketHandlerSet = HashMap<PacketType, PacketHandler>;

fn handle_connect_with_successful_connack(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Connect(_) = packet {
        context.connect_count += 1;
        let response = Box::new(MqttPacket::Connack(ConnackPacket {
            ..Default::default()
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_connect_with_session_resumption(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Connect(connect) = packet {
        context.connect_count += 1;
        let response = Box::new(MqttPacket::Connack(ConnackPacket {
            session_present : !connect.clean_start,
            ..Default::default()
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_connect_with_bogus_session_present(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Connect(_) = packet {
        let response = Box::new(MqttPacket::Connack(ConnackPacket {
            session_present : true,
            ..Default::default()
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_connect_with_failure_connack(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Connect(_) = packet {
        let response = Box::new(MqttPacket::Connack(ConnackPacket {
            return_code : ConnectReturnCode::NotAuthorized,
            ..Default::default()
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_pingreq_with_pingresp(_: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    let response = Box::new(MqttPacket::Pingresp(PingrespPacket{}));
    response_packets.push_back(response);

    Ok(())
}

fn handle_publish_with_success_no_relay(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Publish(publish) = packet {
        match publish.qos {
            QualityOfService::AtMostOnce => {}
            QualityOfService::AtLeastOnce => {
                let response = Box::new(MqttPacket::Puback(PubackPacket{
                    packet_id : publish.packet_id,
                }));
                response_packets.push_back(response);
            }
            QualityOfService::ExactlyOnce => {
                let response = Box::new(MqttPacket::Pubrec(PubrecPacket{
                    packet_id : publish.packet_id,
                }));
                response_packets.push_back(response);
            }
        }

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_pubrel_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Pubrel(pubrel) = packet {
        let response = Box::new(MqttPacket::Pubcomp(PubcompPacket{
            packet_id : pubrel.packet_id,
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_subscribe_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Subscribe(subscribe) = packet {
        let mut return_codes = Vec::new();
        for subscription in &subscribe.subscriptions {
            match subscription.qos {
                QualityOfService::AtMostOnce => { return_codes.push(SubackReturnCode::GrantedQos0); }
                QualityOfService::AtLeastOnce => { return_codes.push(SubackReturnCode::GrantedQos1); }
                QualityOfService::ExactlyOnce => { return_codes.push(SubackReturnCode::GrantedQos2); }
            }
        }

        let response = Box::new(MqttPacket::Suback(SubackPacket{
            packet_id : subscribe.packet_id,
            return_codes,
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_subscribe_with_failure(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Subscribe(subscribe) = packet {
        let return_codes = subscribe.subscriptions.iter().map(|_| SubackReturnCode::Failure).collect();

        let response = Box::new(MqttPacket::Suback(SubackPacket{
            packet_id : subscribe.packet_id,
            return_codes,
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_unsubscribe_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    if let MqttPacket::Unsubscribe(unsubscribe) = packet {
        let response = Box::new(MqttPacket::Unsuback(UnsubackPacket{
            packet_id : unsubscribe.packet_id,
        }));
        response_packets.push_back(response);

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_with_panic(_: &MqttPacket, _: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    panic!("Invalid packet handler state")
}

fn handle_with_nothing(_: &MqttPacket, _: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> SchistResult<()> {
    Ok(())
}

pub(crate) fn create_default_packet_handlers() -> PacketHandlerSet {
    let mut handlers : HashMap<PacketType, PacketHandler> = HashMap::new();

    handlers.insert(PacketType::Connect, Box::new(handle_connect_with_successful_connack));
    handlers.insert(PacketType::Pingreq, Box::new(handle_pingreq_with_pingresp));
    handlers.insert(PacketType::Publish, Box::new(handle_publish_with_success_no_relay));
    handlers.insert(PacketType::Pubrel, Box::new(handle_pubrel_with_success));
    handlers.insert(PacketType::Subscribe, Box::new(handle_subscribe_with_success));
    handlers.insert(PacketType::Unsubscribe, Box::new(handle_unsubscribe_with_success));

    handlers.insert(PacketType::Disconnect, Box::new(handle_with_nothing));
    handlers.insert(PacketType::Puback, Box::new(handle_with_nothing));
    handlers.insert(PacketType::Pubrec, Box::new(handle_with_nothing));
    handlers.insert(PacketType::Pubcomp, Box::new(handle_with_nothing));

    handlers.insert(PacketType::Connack, Box::new(handle_with_panic));
    handlers.insert(PacketType::Suback, Box::new(handle_with_panic));
    handlers.insert(PacketType::Unsuback, Box::new(handle_with_panic));
    handlers.insert(PacketType::Pingresp, Box::new(handle_with_panic));

    handlers
}

// Drives a ProtocolState against a scripted broker on a simulated clock.  All times are
// milliseconds since the fixture was created.
struct ProtocolStateTestFixture {
    base_timestamp: Instant,

    broker_decoder: Decoder,
    broker_encoder: Encoder,

    pub client_state: ProtocolState,

    pub client_packet_events: VecDeque<PacketEvent>,

    pub to_broker_packet_stream: VecDeque<Box<MqttPacket>>,
    pub to_client_packet_stream: VecDeque<Box<MqttPacket>>,

    pub broker_packet_handlers: PacketHandlerSet,

    test_context: BrokerTestContext
}

impl ProtocolStateTestFixture {

    pub(crate) fn new(config : ProtocolStateConfig) -> Self {
        Self {
            base_timestamp : config.base_timestamp,
            broker_decoder: Decoder::new(),
            broker_encoder: Encoder::new(),
            client_state: ProtocolState::new(config),
            client_packet_events : VecDeque::new(),
            to_broker_packet_stream : VecDeque::new(),
            to_client_packet_stream : VecDeque::new(),
            broker_packet_handlers : create_default_packet_handlers(),
            test_context: BrokerTestContext::default()
        }
    }

    fn new_with_session(clean_start: bool, keep_alive_seconds: u16) -> Self {
        let mut fixture = Self::new(build_standard_test_config());
        assert!(fixture.begin_session(0, build_connection_config(clean_start, keep_alive_seconds)).is_ok());

        fixture
    }

    fn time(&self, elapsed_millis: u64) -> Instant {
        self.base_timestamp + Duration::from_millis(elapsed_millis)
    }

    fn handle_to_broker_packet(&mut self, packet: &MqttPacket, response_bytes: &mut Vec<u8>) -> SchistResult<()> {
        let mut response_packets = VecDeque::new();
        let packet_type = packet.packet_type();

        if let Some(handler) = self.broker_packet_handlers.get(&packet_type) {
            (*handler)(packet, &mut response_packets, &mut self.test_context)?;

            let mut encode_buffer = Vec::with_capacity(4096);

            for response_packet in &response_packets {
                self.broker_encoder.reset(response_packet)?;

                let mut encode_result = EncodeResult::Full;
                while encode_result == EncodeResult::Full {
                    encode_result = self.broker_encoder.encode(response_packet, &mut encode_buffer)?;
                    response_bytes.append(&mut encode_buffer);
                }
            }

            self.to_client_packet_stream.append(&mut response_packets);
        }

        Ok(())
    }

    pub(crate) fn begin_session(&mut self, elapsed_millis: u64, config: ConnectionConfig) -> SchistResult<()> {
        let current_time = self.time(elapsed_millis);
        self.client_state.begin_session(config, &current_time)
    }

    pub(crate) fn service_with_drain(&mut self, elapsed_millis: u64, socket_buffer_size: usize) -> SchistResult<Vec<u8>> {
        let current_time = self.time(elapsed_millis);
        let mut done = false;
        let mut response_bytes = Vec::new();

        while !done {
            let mut to_socket = Vec::with_capacity(socket_buffer_size);
            let mut broker_packets = VecDeque::new();

            let mut service_context = ServiceContext {
                to_socket: &mut to_socket,
                current_time,
            };

            self.client_state.service(&mut service_context)?;
            if !to_socket.is_empty() {
                let mut network_event = NetworkEventContext {
                    event: NetworkEvent::WriteCompletion,
                    current_time,
                    packet_events: &mut self.client_packet_events,
                };

                let completion_result = self.client_state.handle_network_event(&mut network_event);

                let mut decode_context = DecodingContext {
                    maximum_packet_size : MAXIMUM_VARIABLE_LENGTH_INTEGER as u32,
                    decoded_packets: &mut broker_packets,
                };

                if self.broker_decoder.decode_bytes(to_socket.as_slice(), &mut decode_context).is_err() {
                    panic!("Test triggered broker decode failure");
                }

                for packet in &broker_packets {
                    if self.handle_to_broker_packet(packet, &mut response_bytes).is_err() {
                        panic!("Test triggered broker packet handling failure");
                    }
                }

                self.to_broker_packet_stream.append(&mut broker_packets);

                completion_result?
            } else {
                done = true;
            }
        }

        Ok(response_bytes)
    }

    pub(crate) fn service_round_trip(&mut self, service_time: u64, response_time: u64, socket_buffer_size: usize) -> SchistResult<()> {
        let server_bytes = self.service_with_drain(service_time, socket_buffer_size)?;

        self.on_incoming_bytes(response_time, server_bytes.as_slice())?;

        Ok(())
    }

    pub(crate) fn on_connection_opened(&mut self, elapsed_millis: u64) -> SchistResult<()> {
        let now = self.time(elapsed_millis);
        let establishment_timeout = now + Duration::from_millis(CONNACK_TIMEOUT_MILLIS);

        let mut context = NetworkEventContext {
            current_time : now,
            event: NetworkEvent::ConnectionOpened(ConnectionOpenedContext{
                establishment_timeout
            }),
            packet_events: &mut self.client_packet_events,
        };

        self.client_state.handle_network_event(&mut context)
    }

    pub(crate) fn on_connection_closed(&mut self, elapsed_millis: u64) -> SchistResult<()> {
        self.broker_decoder.reset_for_new_connection();

        let mut context = NetworkEventContext {
            current_time : self.time(elapsed_millis),
            event: NetworkEvent::ConnectionClosed,
            packet_events: &mut self.client_packet_events,
        };

        self.client_state.handle_network_event(&mut context)
    }

    pub(crate) fn on_incoming_bytes(&mut self, elapsed_millis: u64, bytes: &[u8]) -> SchistResult<()> {
        let mut context = NetworkEventContext {
            current_time : self.time(elapsed_millis),
            event: NetworkEvent::IncomingData(bytes),
            packet_events: &mut self.client_packet_events,
        };

        self.client_state.handle_network_event(&mut context)
    }

    // Delivers a broker packet that no handler generated
    pub(crate) fn send_to_client(&mut self, elapsed_millis: u64, packet: MqttPacket) -> SchistResult<()> {
        let bytes = encode_packet_for_test(&packet);
        self.to_client_packet_stream.push_back(Box::new(packet));

        self.on_incoming_bytes(elapsed_millis, bytes.as_slice())
    }

    pub(crate) fn get_next_service_time(&mut self, elapsed_millis: u64) -> Option<u64> {
        let current_time = self.time(elapsed_millis);
        let next_service_timepoint = self.client_state.get_next_service_timepoint(&current_time);

        if let Some(service_timepoint) = &next_service_timepoint {
            let next_service_millis = (*service_timepoint - self.base_timestamp).as_millis();
            return Some(next_service_millis as u64);
        }

        None
    }

    pub(crate) fn subscribe(&mut self, elapsed_millis: u64, subscribe: SubscribePacket) -> Receiver<SubscribeResult> {
        let (sender, receiver) = std::sync::mpsc::channel();
        let packet = Box::new(MqttPacket::Subscribe(subscribe));
        let handler: ResponseHandler<SubscribeResult> = Box::new(move |res| {
            let _ = sender.send(res);
            Ok(())
        });
        let subscribe_options = SubscribeOptionsInternal {
            options: SubscribeOptions::default(),
            response_handler : Some(handler)
        };

        self.client_state.handle_user_event(UserEventContext {
            event: UserEvent::Subscribe(packet, subscribe_options),
            current_time: self.time(elapsed_millis)
        });

        receiver
    }

    pub(crate) fn unsubscribe(&mut self, elapsed_millis: u64, unsubscribe: UnsubscribePacket) -> Receiver<UnsubscribeResult> {
        let (sender, receiver) = std::sync::mpsc::channel();
        let packet = Box::new(MqttPacket::Unsubscribe(unsubscribe));
        let handler : ResponseHandler<UnsubscribeResult> = Box::new(move |res| {
            let _ = sender.send(res);
            Ok(())
        });
        let unsubscribe_options = UnsubscribeOptionsInternal {
            options: UnsubscribeOptions::default(),
            response_handler : Some(handler)
        };

        self.client_state.handle_user_event(UserEventContext {
            event: UserEvent::Unsubscribe(packet, unsubscribe_options),
            current_time: self.time(elapsed_millis)
        });

        receiver
    }

    pub(crate) fn publish(&mut self, elapsed_millis: u64, publish: PublishPacket, options: PublishOptions) -> Receiver<PublishResult> {
        let (sender, receiver) = std::sync::mpsc::channel();
        let packet = Box::new(MqttPacket::Publish(publish));
        let handler : ResponseHandler<PublishResult> = Box::new(move |res| {
            let _ = sender.send(res);
            Ok(())
        });
        let publish_options = PublishOptionsInternal {
            options,
            response_handler : Some(handler)
        };

        self.client_state.handle_user_event(UserEventContext {
            event: UserEvent::Publish(packet, publish_options),
            current_time: self.time(elapsed_millis)
        });

        receiver
    }

    pub(crate) fn disconnect(&mut self, elapsed_millis: u64) {
        let packet = Box::new(MqttPacket::Disconnect(DisconnectPacket{}));

        self.client_state.handle_user_event(UserEventContext {
            event: UserEvent::Disconnect(packet),
            current_time: self.time(elapsed_millis)
        });
    }

    pub(crate) fn advance_disconnected_to_state(&mut self, state: ProtocolStateType, elapsed_millis: u64) -> SchistResult<()> {
        assert_eq!(ProtocolStateType::Disconnected, self.client_state.state);

        let result = match state {
            ProtocolStateType::PendingConnack => {
                self.on_connection_opened(elapsed_millis)
            }
            ProtocolStateType::Connected => {
                self.on_connection_opened(elapsed_millis)?;
                let server_bytes = self.service_with_drain(elapsed_millis, 4096)?;
                self.on_incoming_bytes(elapsed_millis, server_bytes.as_slice())
            }
            ProtocolStateType::Halted => {
                self.on_connection_opened(elapsed_millis)?;
                self.on_connection_opened(elapsed_millis).unwrap_or(());
                Ok(())
            }
            ProtocolStateType::PendingDisconnect => {
                panic!("Not supported");
            }
            ProtocolStateType::Disconnected => { Ok(()) }
        };

        assert_eq!(state, self.client_state.state);

        result
    }

    fn outbound_stage(&self, packet_id: u16) -> Option<ExchangeStage> {
        self.client_state.session().outbound().get(&packet_id).map(|exchange| exchange.stage())
    }
}

fn find_nth_packet_of_type<'a, T>(packet_sequence : T, packet_type : PacketType, count: usize, start_position : Option<usize>, end_position : Option<usize>) -> Option<(usize, &'a MqttPacket)> where T : Iterator<Item = &'a Box<MqttPacket>> {
    let start = start_position.unwrap_or(0);
    let mut index = start;
    let mut seen = 0;

    for packet in packet_sequence.skip(start) {
        if packet.packet_type() == packet_type {
            seen += 1;
            if seen == count {
                return Some((index, packet));
            }
        }

        index += 1;
        if let Some(end) = end_position {
            if index >= end {
                return None;
            }
        }
    }

    None
}

fn count_packets_of_type<'a, T>(packet_sequence : T, packet_type : PacketType) -> usize where T : Iterator<Item = &'a Box<MqttPacket>> {
    packet_sequence.filter(|packet| packet.packet_type() == packet_type).count()
}

fn verify_packet_type_sequence<'a, T, U>(packet_sequence : T, expected_sequence : U, start_position : Option<usize>) where T : Iterator<Item = &'a Box<MqttPacket>>, U : Iterator<Item = PacketType> {
    let start = start_position.unwrap_or(0);
    let type_sequence = packet_sequence.skip(start).map(|packet|{ packet.packet_type() });

    assert!(expected_sequence.eq(type_sequence));
}

fn verify_protocol_state_empty(fixture: &ProtocolStateTestFixture) {
    assert_eq!(0, fixture.client_state.operations.len());
    assert_eq!(0, fixture.client_state.user_operation_queue.len());
    assert_eq!(0, fixture.client_state.resubmit_operation_queue.len());
    assert_eq!(0, fixture.client_state.high_priority_operation_queue.len());
    assert_eq!(0, fixture.client_state.operation_ack_timeouts.len());
    assert_eq!(0, fixture.client_state.allocated_packet_ids.len());
    assert_eq!(0, fixture.client_state.pending_publish_operations.len());
    assert_eq!(0, fixture.client_state.pending_non_publish_operations.len());
    assert_eq!(0, fixture.client_state.pending_write_completion_operations.len());
}

fn count_publish_events(fixture: &ProtocolStateTestFixture) -> usize {
    fixture.client_packet_events.iter().filter(|event| matches!(event, PacketEvent::Publish(_))).count()
}

fn build_publish(topic: &str, qos: QualityOfService, payload: &[u8]) -> PublishPacket {
    PublishPacket::builder(topic.to_string(), qos)
        .with_payload(payload.to_vec())
        .build()
}

fn get_publish_packet_id(fixture: &ProtocolStateTestFixture, count: usize, start_position: Option<usize>) -> u16 {
    match find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, count, start_position, None) {
        Some((_, MqttPacket::Publish(publish))) => { publish.packet_id }
        _ => { panic!("expected publish packet not found") }
    }
}

#[test]
fn connection_established_after_successful_connack() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);

    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect).into_iter(), None);
    if let Some(MqttPacket::Connect(connect)) = fixture.to_broker_packet_stream.front().map(|packet| &**packet) {
        assert_eq!(CLIENT_ID, connect.client_id);
        assert!(connect.clean_start);
        assert_eq!(0, connect.keep_alive_interval_seconds);
    } else {
        panic!("Expected connect packet");
    }

    assert_eq!(1, fixture.client_packet_events.len());
    assert_matches!(fixture.client_packet_events.front(), Some(PacketEvent::Connack(connack)) if !connack.session_present);
    assert_eq!(None, fixture.get_next_service_time(0));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn connection_opened_without_session_fails() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());

    assert_matches!(fixture.on_connection_opened(0), Err(SchistError::InternalStateError(_)));
}

#[test]
fn begin_session_while_connected_fails() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    assert_matches!(fixture.begin_session(10, build_connection_config(true, 0)), Err(SchistError::InternalStateError(_)));
}

#[test]
fn connack_rejection_halts_with_return_code() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_failure_connack));

    assert!(fixture.on_connection_opened(0).is_ok());
    let server_bytes = fixture.service_with_drain(0, 4096).unwrap();

    let result = fixture.on_incoming_bytes(0, server_bytes.as_slice());
    assert_matches!(result, Err(SchistError::ConnectionEstablishmentFailure(context)) if context.return_code == Some(ConnectReturnCode::NotAuthorized));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn connack_session_present_on_clean_start_is_protocol_error() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_bogus_session_present));

    assert!(fixture.on_connection_opened(0).is_ok());
    let server_bytes = fixture.service_with_drain(0, 4096).unwrap();

    assert_matches!(fixture.on_incoming_bytes(0, server_bytes.as_slice()), Err(SchistError::ProtocolError(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn connack_timeout_halts() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_with_nothing));

    assert!(fixture.on_connection_opened(0).is_ok());
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    assert_eq!(Some(CONNACK_TIMEOUT_MILLIS), fixture.get_next_service_time(0));

    assert!(fixture.service_with_drain(CONNACK_TIMEOUT_MILLIS - 1, 4096).is_ok());
    assert_matches!(fixture.service_with_drain(CONNACK_TIMEOUT_MILLIS, 4096), Err(SchistError::ConnectionEstablishmentFailure(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn incoming_data_before_connect_written_is_protocol_error() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.on_connection_opened(0).is_ok());

    let connack = MqttPacket::Connack(ConnackPacket::default());
    assert_matches!(fixture.send_to_client(0, connack), Err(SchistError::ProtocolError(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn server_disconnect_is_protocol_error() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    assert_matches!(fixture.send_to_client(10, MqttPacket::Disconnect(DisconnectPacket{})), Err(SchistError::ProtocolError(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn operations_queued_while_disconnected_wait_for_connack() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);

    let publish_receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"queued"), PublishOptions::default());
    assert!(fixture.on_connection_opened(0).is_ok());
    assert!(fixture.service_with_drain(0, 4096).is_ok());

    // only the connect goes out before the connack
    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect).into_iter(), None);

    let connack = MqttPacket::Connack(ConnackPacket::default());
    assert!(fixture.send_to_client(5, connack).is_ok());
    assert!(fixture.service_round_trip(5, 5, 4096).is_ok());

    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect, PacketType::Publish).into_iter(), None);
    assert_matches!(publish_receiver.try_recv(), Ok(Ok(PublishResponse::Qos1(_))));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos0_publish_completes_on_write_completion() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtMostOnce, b"fire"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());

    assert_matches!(receiver.try_recv(), Ok(Ok(PublishResponse::Qos0)));
    if let Some((_, MqttPacket::Publish(publish))) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 1, None, None) {
        assert_eq!(0, publish.packet_id);
        assert_eq!(Some(b"fire".as_slice()), publish.payload());
    } else {
        panic!("Expected publish packet");
    }

    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos1_publish_completes_on_single_puback() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"once"), PublishOptions::default());
    assert!(fixture.service_round_trip(0, 10, 4096).is_ok());

    let packet_id = get_publish_packet_id(&fixture, 1, None);
    assert_ne!(0, packet_id);

    assert_matches!(receiver.try_recv(), Ok(Ok(PublishResponse::Qos1(puback))) if puback.packet_id == packet_id);
    assert!(receiver.try_recv().is_err());
    assert!(fixture.client_state.session().outbound().is_empty());
    verify_protocol_state_empty(&fixture);

    // the exchange is over; a second acknowledgement has nothing to complete
    let duplicate_puback = MqttPacket::Puback(PubackPacket{ packet_id });
    assert_matches!(fixture.send_to_client(20, duplicate_puback), Err(SchistError::ProtocolError(_)));
}

#[test]
fn qos1_publish_resent_with_duplicate_flag_after_reconnect() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(false, 0);
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let interrupted_receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"interrupted"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());

    let packet_id = get_publish_packet_id(&fixture, 1, None);
    assert_eq!(Some(ExchangeStage::AwaitingPubAck), fixture.outbound_stage(packet_id));

    assert!(fixture.on_connection_closed(10).is_ok());
    assert!(interrupted_receiver.try_recv().is_err());

    let fresh_receiver = fixture.publish(20, build_publish("a/b", QualityOfService::AtLeastOnce, b"fresh"), PublishOptions::default());

    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_publish_with_success_no_relay));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 30).is_ok());
    assert_matches!(fixture.client_packet_events.back(), Some(PacketEvent::Connack(connack)) if connack.session_present);
    assert!(fixture.service_round_trip(30, 30, 4096).is_ok());

    let (reconnect_index, _) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Connect, 2, None, None).unwrap();
    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect, PacketType::Publish, PacketType::Publish).into_iter(), Some(reconnect_index));

    if let Some((_, MqttPacket::Publish(resent))) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 1, Some(reconnect_index), None) {
        assert!(resent.duplicate);
        assert_eq!(packet_id, resent.packet_id);
        assert_eq!(Some(b"interrupted".as_slice()), resent.payload());
    } else {
        panic!("Expected resent publish");
    }

    if let Some((_, MqttPacket::Publish(fresh))) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 2, Some(reconnect_index), None) {
        assert!(!fresh.duplicate);
        assert_ne!(packet_id, fresh.packet_id);
    } else {
        panic!("Expected fresh publish");
    }

    assert_matches!(interrupted_receiver.try_recv(), Ok(Ok(PublishResponse::Qos1(puback))) if puback.packet_id == packet_id);
    assert_matches!(fresh_receiver.try_recv(), Ok(Ok(PublishResponse::Qos1(_))));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos2_publish_stages_never_regress() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(false, 0);
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    fixture.broker_packet_handlers.insert(PacketType::Pubrel, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::ExactlyOnce, b"exactly"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());

    let packet_id = get_publish_packet_id(&fixture, 1, None);
    assert_eq!(Some(ExchangeStage::AwaitingPubRec), fixture.outbound_stage(packet_id));

    assert!(fixture.send_to_client(5, MqttPacket::Pubrec(PubrecPacket{ packet_id })).is_ok());
    assert_eq!(Some(ExchangeStage::AwaitingPubComp), fixture.outbound_stage(packet_id));
    assert!(fixture.service_with_drain(5, 4096).is_ok());
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pubrel));

    // a repeated PUBREC changes nothing
    assert!(fixture.send_to_client(6, MqttPacket::Pubrec(PubrecPacket{ packet_id })).is_ok());
    assert!(fixture.service_with_drain(6, 4096).is_ok());
    assert_eq!(Some(ExchangeStage::AwaitingPubComp), fixture.outbound_stage(packet_id));
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pubrel));
    assert!(receiver.try_recv().is_err());

    // the release is what gets resent after a reconnect, never the publish
    assert!(fixture.on_connection_closed(10).is_ok());
    assert_eq!(Some(ExchangeStage::AwaitingPubComp), fixture.outbound_stage(packet_id));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 20).is_ok());
    assert!(fixture.service_with_drain(20, 4096).is_ok());

    let (reconnect_index, _) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Connect, 2, None, None).unwrap();
    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect, PacketType::Pubrel).into_iter(), Some(reconnect_index));
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Pubrel(pubrel)) if pubrel.packet_id == packet_id);
    assert_eq!(Some(ExchangeStage::AwaitingPubComp), fixture.outbound_stage(packet_id));

    assert!(fixture.send_to_client(25, MqttPacket::Pubcomp(PubcompPacket{ packet_id })).is_ok());
    assert_matches!(receiver.try_recv(), Ok(Ok(PublishResponse::Qos2(pubcomp))) if pubcomp.packet_id == packet_id);
    assert_eq!(None, fixture.outbound_stage(packet_id));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos2_publish_pubcomp_before_pubrec_is_protocol_error() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let _receiver = fixture.publish(0, build_publish("a/b", QualityOfService::ExactlyOnce, b"early"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    let packet_id = get_publish_packet_id(&fixture, 1, None);

    assert_matches!(fixture.send_to_client(5, MqttPacket::Pubcomp(PubcompPacket{ packet_id })), Err(SchistError::ProtocolError(_)));
}

#[test]
fn qos2_publish_full_flow_with_broker() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::ExactlyOnce, b"flow"), PublishOptions::default());
    assert!(fixture.service_round_trip(0, 5, 4096).is_ok());
    assert!(fixture.service_round_trip(5, 10, 4096).is_ok());

    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect, PacketType::Publish, PacketType::Pubrel).into_iter(), None);
    assert_matches!(receiver.try_recv(), Ok(Ok(PublishResponse::Qos2(_))));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos1_incoming_publish_delivered_and_acknowledged() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let publish = PublishPacket {
        packet_id: 3,
        topic: "a/b".to_string(),
        qos: QualityOfService::AtLeastOnce,
        payload: Some(b"incoming".to_vec()),
        ..Default::default()
    };
    assert!(fixture.send_to_client(5, MqttPacket::Publish(publish.clone())).is_ok());
    assert_eq!(Some(&PacketEvent::Publish(publish)), fixture.client_packet_events.back());

    assert!(fixture.service_with_drain(5, 4096).is_ok());
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Puback(puback)) if puback.packet_id == 3);
    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos2_incoming_publish_delivered_once_on_pubrel() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let publish = PublishPacket {
        packet_id: 7,
        topic: "a/b".to_string(),
        qos: QualityOfService::ExactlyOnce,
        payload: Some(b"exactly once".to_vec()),
        ..Default::default()
    };

    assert!(fixture.send_to_client(5, MqttPacket::Publish(publish.clone())).is_ok());
    assert_eq!(0, count_publish_events(&fixture));
    assert!(fixture.client_state.session().inbound().contains_key(&7));
    assert!(fixture.service_with_drain(5, 4096).is_ok());
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Pubrec(pubrec)) if pubrec.packet_id == 7);

    // broker retransmission: acknowledged again, still not delivered
    let retransmission = PublishPacket {
        duplicate: true,
        ..publish.clone()
    };
    assert!(fixture.send_to_client(10, MqttPacket::Publish(retransmission)).is_ok());
    assert_eq!(0, count_publish_events(&fixture));
    assert!(fixture.service_with_drain(10, 4096).is_ok());
    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pubrec));

    assert!(fixture.send_to_client(15, MqttPacket::Pubrel(PubrelPacket{ packet_id: 7 })).is_ok());
    assert_eq!(1, count_publish_events(&fixture));
    assert_eq!(Some(&PacketEvent::Publish(publish)), fixture.client_packet_events.back());
    assert!(fixture.client_state.session().inbound().is_empty());
    assert!(fixture.service_with_drain(15, 4096).is_ok());
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Pubcomp(pubcomp)) if pubcomp.packet_id == 7);

    // a repeated release is completed without a second delivery
    assert!(fixture.send_to_client(20, MqttPacket::Pubrel(PubrelPacket{ packet_id: 7 })).is_ok());
    assert!(fixture.service_with_drain(20, 4096).is_ok());
    assert_eq!(1, count_publish_events(&fixture));
    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pubcomp));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn lost_broker_session_drops_unreleased_incoming_qos2() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(false, 0);
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let publish = PublishPacket {
        packet_id: 9,
        topic: "a/b".to_string(),
        qos: QualityOfService::ExactlyOnce,
        payload: Some(b"never released".to_vec()),
        ..Default::default()
    };

    assert!(fixture.send_to_client(5, MqttPacket::Publish(publish)).is_ok());
    assert!(fixture.service_with_drain(5, 4096).is_ok());
    assert_eq!(Some(ExchangeStage::AwaitingPubRel), fixture.client_state.session().inbound().get(&9).map(|exchange| exchange.stage()));

    assert!(fixture.on_connection_closed(10).is_ok());
    assert_eq!(1, fixture.client_state.session().inbound().len());

    // the broker answers the resumed connect without its session
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_successful_connack));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 20).is_ok());

    assert!(fixture.client_state.session().inbound().is_empty());
    assert_eq!(0, count_publish_events(&fixture));

    // a stray release for the dropped exchange completes without delivery
    assert!(fixture.send_to_client(25, MqttPacket::Pubrel(PubrelPacket{ packet_id: 9 })).is_ok());
    assert!(fixture.service_with_drain(25, 4096).is_ok());
    assert_eq!(0, count_publish_events(&fixture));
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Pubcomp(pubcomp)) if pubcomp.packet_id == 9);
}

#[test]
fn subscribe_and_unsubscribe_track_session_subscriptions() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let subscribe = SubscribePacket::builder()
        .with_subscription_simple("a/b", QualityOfService::AtLeastOnce)
        .with_subscription_simple("c/#", QualityOfService::ExactlyOnce)
        .build();
    let subscribe_receiver = fixture.subscribe(0, subscribe);
    assert!(fixture.service_round_trip(0, 5, 4096).is_ok());

    assert_matches!(subscribe_receiver.try_recv(), Ok(Ok(suback)) if suback.return_codes == vec!(SubackReturnCode::GrantedQos1, SubackReturnCode::GrantedQos2));
    assert_eq!(Some(&QualityOfService::AtLeastOnce), fixture.client_state.session().subscriptions().get("a/b"));
    assert_eq!(Some(&QualityOfService::ExactlyOnce), fixture.client_state.session().subscriptions().get("c/#"));

    let unsubscribe = UnsubscribePacket::builder()
        .with_topic_filter("c/#")
        .build();
    let unsubscribe_receiver = fixture.unsubscribe(10, unsubscribe);
    assert!(fixture.service_round_trip(10, 15, 4096).is_ok());

    assert_matches!(unsubscribe_receiver.try_recv(), Ok(Ok(_)));
    assert_eq!(1, fixture.client_state.session().subscriptions().len());
    assert!(fixture.client_state.session().subscriptions().contains_key("a/b"));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn rejected_subscription_not_recorded() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Subscribe, Box::new(handle_subscribe_with_failure));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let subscribe = SubscribePacket::builder()
        .with_subscription_simple("forbidden/#", QualityOfService::AtLeastOnce)
        .build();
    let receiver = fixture.subscribe(0, subscribe);
    assert!(fixture.service_round_trip(0, 5, 4096).is_ok());

    assert_matches!(receiver.try_recv(), Ok(Ok(suback)) if suback.return_codes == vec!(SubackReturnCode::Failure));
    assert!(fixture.client_state.session().subscriptions().is_empty());
}

fn establish_persistent_subscription(fixture: &mut ProtocolStateTestFixture) {
    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let subscribe = SubscribePacket::builder()
        .with_subscription_simple("a/b", QualityOfService::AtLeastOnce)
        .build();
    let receiver = fixture.subscribe(0, subscribe);
    assert!(fixture.service_round_trip(0, 5, 4096).is_ok());
    assert_matches!(receiver.try_recv(), Ok(Ok(_)));

    assert!(fixture.on_connection_closed(10).is_ok());
}

#[test]
fn no_resubscribe_when_session_present() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(false, 0);
    establish_persistent_subscription(&mut fixture);

    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 20).is_ok());
    assert!(fixture.service_round_trip(20, 25, 4096).is_ok());

    assert_eq!(2, fixture.test_context.connect_count);
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Subscribe));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn resubscribe_when_session_lost() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(false, 0);
    establish_persistent_subscription(&mut fixture);

    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_successful_connack));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 20).is_ok());
    assert!(fixture.service_round_trip(20, 25, 4096).is_ok());

    let (reconnect_index, _) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Connect, 2, None, None).unwrap();
    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), vec!(PacketType::Connect, PacketType::Subscribe).into_iter(), Some(reconnect_index));

    if let Some((_, MqttPacket::Subscribe(subscribe))) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Subscribe, 1, Some(reconnect_index), None) {
        assert_eq!(vec!(Subscription::new("a/b", QualityOfService::AtLeastOnce)), subscribe.subscriptions);
    } else {
        panic!("Expected resubscribe packet");
    }

    assert_eq!(Some(&QualityOfService::AtLeastOnce), fixture.client_state.session().subscriptions().get("a/b"));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn resubscribe_precedes_queued_user_operations() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(false, 0);
    establish_persistent_subscription(&mut fixture);

    let subscribe = SubscribePacket::builder()
        .with_subscription_simple("b/c", QualityOfService::AtMostOnce)
        .build();
    let _receiver = fixture.subscribe(15, subscribe);

    fixture.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_successful_connack));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 20).is_ok());
    assert!(fixture.service_round_trip(20, 25, 4096).is_ok());

    let (reconnect_index, _) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Connect, 2, None, None).unwrap();
    if let Some((_, MqttPacket::Subscribe(subscribe))) = find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Subscribe, 1, Some(reconnect_index), None) {
        assert_eq!(vec!(Subscription::new("a/b", QualityOfService::AtLeastOnce)), subscribe.subscriptions);
    } else {
        panic!("Expected resubscribe packet");
    }

    assert_eq!(2, fixture.client_state.session().subscriptions().len());
}

#[test]
fn keep_alive_single_ping_then_timeout() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 10);
    fixture.broker_packet_handlers.insert(PacketType::Pingreq, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    assert_eq!(Some(10000), fixture.get_next_service_time(0));
    assert!(fixture.service_with_drain(9999, 4096).is_ok());
    assert_eq!(0, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));

    assert!(fixture.service_with_drain(10000, 4096).is_ok());
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));
    assert_eq!(Some(20000), fixture.get_next_service_time(10000));

    assert!(fixture.service_with_drain(15000, 4096).is_ok());
    assert!(fixture.service_with_drain(19999, 4096).is_ok());
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));

    assert_matches!(fixture.service_with_drain(20000, 4096), Err(SchistError::ConnectionLost(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));
}

#[test]
fn keep_alive_pingresp_keeps_connection_alive() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 10);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    assert!(fixture.service_round_trip(10000, 10050, 4096).is_ok());
    assert_eq!(1, count_packets_of_type(fixture.to_client_packet_stream.iter(), PacketType::Pingresp));
    assert_eq!(Some(20000), fixture.get_next_service_time(10050));

    assert!(fixture.service_round_trip(20000, 20050, 4096).is_ok());
    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));
    assert_eq!(ProtocolStateType::Connected, fixture.client_state.state());
}

#[test]
fn keep_alive_deferred_by_outbound_traffic() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 10);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let _receiver = fixture.publish(6000, build_publish("a/b", QualityOfService::AtMostOnce, b"traffic"), PublishOptions::default());
    assert!(fixture.service_with_drain(6000, 4096).is_ok());

    assert_eq!(Some(16000), fixture.get_next_service_time(6000));
    assert!(fixture.service_with_drain(10000, 4096).is_ok());
    assert_eq!(0, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));
}

#[test]
fn unsolicited_pingresp_is_protocol_error() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 10);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    assert_matches!(fixture.send_to_client(100, MqttPacket::Pingresp(PingrespPacket{})), Err(SchistError::ProtocolError(_)));
}

#[test]
fn packet_ids_wrap_and_skip_ids_in_use() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let _first_receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"1"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    assert_eq!(1, get_publish_packet_id(&fixture, 1, None));

    fixture.client_state.next_packet_id = u16::MAX;

    let _second_receiver = fixture.publish(10, build_publish("a/b", QualityOfService::AtLeastOnce, b"2"), PublishOptions::default());
    let _third_receiver = fixture.publish(10, build_publish("a/b", QualityOfService::AtLeastOnce, b"3"), PublishOptions::default());
    assert!(fixture.service_with_drain(10, 4096).is_ok());

    // 65535, then 1 is still in flight so the id after wrapping is 2
    assert_eq!(u16::MAX, get_publish_packet_id(&fixture, 2, None));
    assert_eq!(2, get_publish_packet_id(&fixture, 3, None));
}

#[test]
fn ack_timeout_fails_publish() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let options = PublishOptionsBuilder::new().with_ack_timeout(Duration::from_secs(5)).build();
    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"slow"), options);
    assert!(fixture.service_with_drain(0, 4096).is_ok());

    assert_eq!(Some(5000), fixture.get_next_service_time(0));
    assert!(fixture.service_with_drain(4999, 4096).is_ok());
    assert!(receiver.try_recv().is_err());

    assert!(fixture.service_with_drain(5000, 4096).is_ok());
    assert_matches!(receiver.try_recv(), Ok(Err(SchistError::AckTimeout(_))));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn late_puback_after_ack_timeout_is_ignored() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let options = PublishOptionsBuilder::new().with_ack_timeout(Duration::from_secs(5)).build();
    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"slow"), options);
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    let packet_id = get_publish_packet_id(&fixture, 1, None);

    assert!(fixture.service_with_drain(5000, 4096).is_ok());
    assert_matches!(receiver.try_recv(), Ok(Err(SchistError::AckTimeout(_))));

    assert!(fixture.send_to_client(6000, MqttPacket::Puback(PubackPacket{ packet_id })).is_ok());
    assert_eq!(ProtocolStateType::Connected, fixture.client_state.state());
    assert!(fixture.client_state.timed_out_packet_ids.is_empty());
    verify_protocol_state_empty(&fixture);

    // only the first late ack is forgiven
    assert_matches!(fixture.send_to_client(6001, MqttPacket::Puback(PubackPacket{ packet_id })), Err(SchistError::ProtocolError(_)));
}

#[test]
fn late_pubcomp_after_ack_timeout_is_ignored() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    fixture.broker_packet_handlers.insert(PacketType::Pubrel, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let options = PublishOptionsBuilder::new().with_ack_timeout(Duration::from_secs(5)).build();
    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::ExactlyOnce, b"slow"), options);
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    let packet_id = get_publish_packet_id(&fixture, 1, None);

    assert!(fixture.send_to_client(10, MqttPacket::Pubrec(PubrecPacket{ packet_id })).is_ok());
    assert!(fixture.service_with_drain(10, 4096).is_ok());
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pubrel));

    // writing the pubrel arms a second timeout for the same operation
    assert!(fixture.service_with_drain(5010, 4096).is_ok());
    assert_matches!(receiver.try_recv(), Ok(Err(SchistError::AckTimeout(_))));

    assert!(fixture.send_to_client(6000, MqttPacket::Pubcomp(PubcompPacket{ packet_id })).is_ok());
    assert_eq!(ProtocolStateType::Connected, fixture.client_state.state());
    verify_protocol_state_empty(&fixture);

    // the connection keeps working afterwards
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_publish_with_success_no_relay));
    let follow_up = fixture.publish(6000, build_publish("a/b", QualityOfService::AtLeastOnce, b"next"), PublishOptions::default());
    assert!(fixture.service_round_trip(6000, 6010, 4096).is_ok());
    assert_matches!(follow_up.try_recv(), Ok(Ok(PublishResponse::Qos1(_))));
}

#[test]
fn timed_out_packet_ids_forgotten_on_connection_closed() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let options = PublishOptionsBuilder::new().with_ack_timeout(Duration::from_secs(5)).build();
    let _receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"slow"), options);
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    assert!(fixture.service_with_drain(5000, 4096).is_ok());
    assert_eq!(1, fixture.client_state.timed_out_packet_ids.len());

    assert!(fixture.on_connection_closed(5010).is_ok());
    assert!(fixture.client_state.timed_out_packet_ids.is_empty());
}

#[test]
fn user_disconnect_halts_after_write() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    fixture.disconnect(10);
    assert_matches!(fixture.service_with_drain(10, 4096), Err(SchistError::UserInitiatedDisconnect(_)));

    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Disconnect(_)));
}

#[test]
fn connection_closed_requeues_unacknowledged_subscribe() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Subscribe, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let subscribe = SubscribePacket::builder()
        .with_subscription_simple("a/b", QualityOfService::AtLeastOnce)
        .build();
    let subscribe_receiver = fixture.subscribe(0, subscribe);
    assert!(fixture.service_with_drain(0, 4096).is_ok());

    assert!(fixture.on_connection_closed(10).is_ok());
    assert!(subscribe_receiver.try_recv().is_err());
    assert_eq!(1, fixture.client_state.user_operation_queue.len());

    fixture.broker_packet_handlers.insert(PacketType::Subscribe, Box::new(handle_subscribe_with_success));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 20).is_ok());
    assert!(fixture.service_round_trip(20, 25, 4096).is_ok());

    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Subscribe));
    assert_matches!(subscribe_receiver.try_recv(), Ok(Ok(_)));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn stored_session_resumed_by_new_protocol_state() {
    let store = InMemorySessionStore::new();

    let mut first = ProtocolStateTestFixture::new(build_test_config_with_store(store.clone()));
    assert!(first.begin_session(0, build_connection_config(false, 0)).is_ok());
    first.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    first.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(first.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let _receiver = first.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"persisted"), PublishOptions::default());
    assert!(first.service_with_drain(0, 4096).is_ok());
    let packet_id = get_publish_packet_id(&first, 1, None);

    let stored = store.get(CLIENT_ID).unwrap();
    assert_eq!(ExchangeStage::AwaitingPubAck, stored.outbound().get(&packet_id).unwrap().stage());

    let mut second = ProtocolStateTestFixture::new(build_test_config_with_store(store.clone()));
    assert!(second.begin_session(0, build_connection_config(false, 0)).is_ok());
    assert_eq!(1, second.client_state.resubmit_operation_queue.len());

    second.broker_packet_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    assert!(second.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());
    assert!(second.service_round_trip(0, 5, 4096).is_ok());

    verify_packet_type_sequence(second.to_broker_packet_stream.iter(), vec!(PacketType::Connect, PacketType::Publish).into_iter(), None);
    if let Some((_, MqttPacket::Publish(resent))) = find_nth_packet_of_type(second.to_broker_packet_stream.iter(), PacketType::Publish, 1, None, None) {
        assert!(resent.duplicate);
        assert_eq!(packet_id, resent.packet_id);
    } else {
        panic!("Expected resent publish");
    }

    assert!(store.get(CLIENT_ID).unwrap().outbound().is_empty());
    verify_protocol_state_empty(&second);
}

#[test]
fn clean_start_discards_previous_session() {
    let store = InMemorySessionStore::new();

    let mut fixture = ProtocolStateTestFixture::new(build_test_config_with_store(store.clone()));
    assert!(fixture.begin_session(0, build_connection_config(false, 0)).is_ok());
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"doomed"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    assert!(fixture.on_connection_closed(10).is_ok());
    assert!(store.get(CLIENT_ID).is_some());

    assert!(fixture.begin_session(20, build_connection_config(true, 0)).is_ok());

    assert_matches!(receiver.try_recv(), Ok(Err(SchistError::OtherError(_))));
    assert!(store.get(CLIENT_ID).is_none());
    assert!(fixture.client_state.session().outbound().is_empty());
    verify_protocol_state_empty(&fixture);
}

#[test]
fn reset_fails_all_operations_with_client_closed() {
    let mut fixture = ProtocolStateTestFixture::new_with_session(true, 0);
    fixture.broker_packet_handlers.insert(PacketType::Publish, Box::new(handle_with_nothing));
    assert!(fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).is_ok());

    let in_flight_receiver = fixture.publish(0, build_publish("a/b", QualityOfService::AtLeastOnce, b"in flight"), PublishOptions::default());
    assert!(fixture.service_with_drain(0, 4096).is_ok());
    let queued_receiver = fixture.publish(5, build_publish("a/b", QualityOfService::AtMostOnce, b"queued"), PublishOptions::default());

    let now = fixture.time(10);
    fixture.client_state.reset(&now);

    assert_matches!(in_flight_receiver.try_recv(), Ok(Err(SchistError::ClientClosed(_))));
    assert_matches!(queued_receiver.try_recv(), Ok(Err(SchistError::ClientClosed(_))));
    assert_eq!(ProtocolStateType::Disconnected, fixture.client_state.state());
    verify_protocol_state_empty(&fixture);
}
