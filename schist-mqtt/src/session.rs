/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing MQTT session state and the pluggable store used to persist it across
connections.
 */

use crate::error::{SchistError, SchistResult};
use crate::mqtt::*;

use log::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Which side of a QoS handshake the client is playing.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ExchangeRole {

    /// The client sent the original packet and is waiting on the broker
    Publisher,

    /// The broker sent the original packet and the client is completing the handshake
    Receiver,
}

/// Current step of an in-flight exchange.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ExchangeStage {

    /// A QoS 1 publish was sent and has not been acknowledged
    AwaitingPubAck,

    /// A QoS 2 publish was sent and has not been received
    AwaitingPubRec,

    /// A QoS 2 publish was received by the broker, the release was sent and has not completed
    AwaitingPubComp,

    /// An incoming QoS 2 publish was received and has not been released by the broker
    AwaitingPubRel,

    /// A subscribe was sent and has not been acknowledged
    AwaitingSubAck,

    /// An unsubscribe was sent and has not been acknowledged
    AwaitingUnsubAck,
}

impl fmt::Display for ExchangeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeStage::AwaitingPubAck => { write!(f, "AwaitingPubAck") }
            ExchangeStage::AwaitingPubRec => { write!(f, "AwaitingPubRec") }
            ExchangeStage::AwaitingPubComp => { write!(f, "AwaitingPubComp") }
            ExchangeStage::AwaitingPubRel => { write!(f, "AwaitingPubRel") }
            ExchangeStage::AwaitingSubAck => { write!(f, "AwaitingSubAck") }
            ExchangeStage::AwaitingUnsubAck => { write!(f, "AwaitingUnsubAck") }
        }
    }
}

/// A QoS 1/2 publish or a subscription change that has not finished its acknowledgement
/// sequence.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InFlightExchange {
    pub(crate) packet_id: u16,
    pub(crate) role: ExchangeRole,
    pub(crate) stage: ExchangeStage,

    // The packet to retransmit: the publish (or subscribe/unsubscribe) itself, or the pubrel once
    // a QoS 2 publish reaches AwaitingPubComp.  For the receiver role this is the publish awaiting
    // release.
    pub(crate) packet: MqttPacket,
    pub(crate) created: SystemTime,
}

impl InFlightExchange {
    pub(crate) fn new(packet_id: u16, role: ExchangeRole, stage: ExchangeStage, packet: MqttPacket) -> Self {
        InFlightExchange {
            packet_id,
            role,
            stage,
            packet,
            created: SystemTime::now(),
        }
    }

    /// Packet id the exchange is keyed by
    pub fn packet_id(&self) -> u16 { self.packet_id }

    /// Which side of the handshake the client is on
    pub fn role(&self) -> ExchangeRole { self.role }

    /// Current handshake step
    pub fn stage(&self) -> ExchangeStage { self.stage }

    /// Packet retained for retransmission or delayed delivery
    pub fn packet(&self) -> &MqttPacket { &self.packet }

    /// When the exchange began
    pub fn created(&self) -> SystemTime { self.created }
}

/// MQTT session state owned by a client: its subscriptions and every unfinished QoS exchange.
///
/// Outbound and inbound exchanges live in separate packet id spaces.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Session {
    pub(crate) client_id: String,
    pub(crate) clean_start: bool,
    pub(crate) subscriptions: HashMap<String, QualityOfService>,
    pub(crate) outbound: BTreeMap<u16, InFlightExchange>,
    pub(crate) inbound: BTreeMap<u16, InFlightExchange>,
}

impl Session {

    /// Creates an empty session
    pub fn new(client_id: &str, clean_start: bool) -> Self {
        Session {
            client_id: client_id.to_string(),
            clean_start,
            subscriptions: HashMap::new(),
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
        }
    }

    /// Client id the session belongs to
    pub fn client_id(&self) -> &str { self.client_id.as_str() }

    /// Whether the session was established with clean start
    pub fn clean_start(&self) -> bool { self.clean_start }

    /// Active subscriptions: topic filter to requested maximum QoS
    pub fn subscriptions(&self) -> &HashMap<String, QualityOfService> { &self.subscriptions }

    /// Unfinished exchanges started by the client, keyed by packet id
    pub fn outbound(&self) -> &BTreeMap<u16, InFlightExchange> { &self.outbound }

    /// Unfinished exchanges started by the broker, keyed by packet id
    pub fn inbound(&self) -> &BTreeMap<u16, InFlightExchange> { &self.inbound }

    /// True if the session holds no subscriptions and no in-flight exchanges
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.outbound.is_empty() && self.inbound.is_empty()
    }
}

/// Storage for session state that must survive reconnects when clean start is off.
///
/// The client calls the store from its runtime task only, so implementations need not be
/// internally synchronized, but must be movable into that task.
pub trait SessionStore : Send {

    /// Returns the stored session for a client id, if any
    fn load(&mut self, client_id: &str) -> SchistResult<Option<Session>>;

    /// Stores (replacing) the session for its client id
    fn save(&mut self, session: &Session) -> SchistResult<()>;

    /// Removes any stored session for a client id
    fn clear(&mut self, client_id: &str) -> SchistResult<()>;
}

/// Default session store.  Sessions live in process memory; clones share the same storage, so the
/// application can keep a handle for inspection or pass it to a later client.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl InMemorySessionStore {

    /// Creates a new, empty store
    pub fn new() -> Self {
        InMemorySessionStore {
            ..Default::default()
        }
    }

    /// Returns a copy of the stored session for a client id, if any
    pub fn get(&self, client_id: &str) -> Option<Session> {
        self.sessions.lock().ok().and_then(|sessions| sessions.get(client_id).cloned())
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// True if no sessions are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_failure<T>(_: T) -> SchistError {
    error!("InMemorySessionStore - session map lock poisoned");
    SchistError::new_session_store_failure("in-memory session store lock poisoned")
}

impl SessionStore for InMemorySessionStore {
    fn load(&mut self, client_id: &str) -> SchistResult<Option<Session>> {
        let sessions = self.sessions.lock().map_err(lock_failure)?;
        Ok(sessions.get(client_id).cloned())
    }

    fn save(&mut self, session: &Session) -> SchistResult<()> {
        let mut sessions = self.sessions.lock().map_err(lock_failure)?;
        debug!("InMemorySessionStore - saving session for client \"{}\": {} subscriptions, {} outbound, {} inbound",
            session.client_id, session.subscriptions.len(), session.outbound.len(), session.inbound.len());
        sessions.insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    fn clear(&mut self, client_id: &str) -> SchistResult<()> {
        let mut sessions = self.sessions.lock().map_err(lock_failure)?;
        debug!("InMemorySessionStore - clearing session for client \"{}\"", client_id);
        sessions.remove(client_id);
        Ok(())
    }
}
