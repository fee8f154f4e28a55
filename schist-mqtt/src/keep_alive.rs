/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{SchistError, SchistResult};

use log::*;
use std::time::{Duration, Instant};

/// Pure, time-driven keep alive tracking for a single connection.
///
/// The timer never performs I/O.  The protocol state asks it whether a PINGREQ is due and whether
/// an outstanding PINGREQ has gone unanswered for too long, passing in the current time on
/// every call.  A keep alive interval of zero disables both pings and ping timeouts.
pub(crate) struct KeepAliveTimer {
    keep_alive: Duration,
    ping_timeout: Duration,

    // Point in time we should send another ping.  None while stopped or disabled.
    next_ping_timepoint: Option<Instant>,

    // Point in time the outstanding ping times out.  None if no ping is outstanding.
    ping_timeout_timepoint: Option<Instant>,
}

impl KeepAliveTimer {
    pub(crate) fn new(keep_alive: Duration, ping_timeout: Duration) -> Self {
        KeepAliveTimer {
            keep_alive,
            ping_timeout,
            next_ping_timepoint: None,
            ping_timeout_timepoint: None,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.keep_alive.is_zero()
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.ping_timeout_timepoint = None;
        if self.is_enabled() {
            self.next_ping_timepoint = Some(now + self.keep_alive);
        } else {
            self.next_ping_timepoint = None;
        }
    }

    pub(crate) fn stop(&mut self) {
        self.next_ping_timepoint = None;
        self.ping_timeout_timepoint = None;
    }

    /// Pushes the next ping out by a full interval.  Ignored while a ping is outstanding.
    pub(crate) fn on_packet_sent(&mut self, now: Instant) {
        if self.next_ping_timepoint.is_some() && self.ping_timeout_timepoint.is_none() {
            self.next_ping_timepoint = Some(now + self.keep_alive);
        }
    }

    /// Returns true exactly once per due ping.  A true result arms the ping timeout, so the caller
    /// must follow up by sending a PINGREQ.
    pub(crate) fn should_send_ping(&mut self, now: Instant) -> bool {
        if self.ping_timeout_timepoint.is_some() {
            return false;
        }

        if let Some(next_ping) = self.next_ping_timepoint {
            if now >= next_ping {
                debug!("keep alive - ping due");
                self.next_ping_timepoint = Some(now + self.keep_alive);
                self.ping_timeout_timepoint = Some(now + self.ping_timeout);
                return true;
            }
        }

        false
    }

    pub(crate) fn on_pingresp(&mut self) -> SchistResult<()> {
        if self.ping_timeout_timepoint.take().is_none() {
            error!("keep alive - PINGRESP received without an outstanding PINGREQ");
            return Err(SchistError::new_protocol_error("pingresp received without an outstanding pingreq"));
        }

        Ok(())
    }

    pub(crate) fn check_ping_timeout(&self, now: Instant) -> SchistResult<()> {
        if let Some(ping_timeout) = self.ping_timeout_timepoint {
            if now >= ping_timeout {
                error!("keep alive - ping timeout exceeded");
                return Err(SchistError::new_connection_lost("keep alive timeout exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn is_ping_outstanding(&self) -> bool {
        self.ping_timeout_timepoint.is_some()
    }

    pub(crate) fn next_service_timepoint(&self) -> Option<Instant> {
        self.ping_timeout_timepoint.or(self.next_ping_timepoint)
    }
}
