/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::config::*;

use log::*;
use std::time::{Duration, Instant};

/// Computes the wait before reconnect attempt number `attempt` (zero-based).
///
/// The undithered delay is `min(max_delay, initial_delay * multiplier^attempt)`.  With
/// [`ExponentialBackoffJitterType::Uniform`] jitter, `jitter_sample` (expected to lie in `[0, 1]`)
/// selects a point uniformly in `[0, delay]`; with [`ExponentialBackoffJitterType::None`] the
/// sample is ignored.
pub fn compute_reconnect_delay(options: &ReconnectOptions, attempt: u32, jitter_sample: f64) -> Duration {
    let initial_secs = options.initial_delay.as_secs_f64();
    let max_secs = options.max_delay.as_secs_f64();
    let exponent = attempt.min(i32::MAX as u32) as i32;

    let mut delay_secs = initial_secs * options.multiplier.powi(exponent);
    if !delay_secs.is_finite() || delay_secs > max_secs {
        delay_secs = max_secs;
    }

    let delay = Duration::from_secs_f64(delay_secs.max(0.0));

    match options.jitter {
        ExponentialBackoffJitterType::None => { delay }
        ExponentialBackoffJitterType::Uniform => {
            delay.mul_f64(jitter_sample.clamp(0.0, 1.0))
        }
    }
}

/// Tracks consecutive reconnect attempts for a client.
pub(crate) struct ReconnectBackoff {
    options: ReconnectOptions,
    attempts: u32,
    successful_connect_time: Option<Instant>,
}

impl ReconnectBackoff {
    pub(crate) fn new(mut options: ReconnectOptions) -> Self {
        options.normalize();

        ReconnectBackoff {
            options,
            attempts: 0,
            successful_connect_time: None,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True if auto-reconnect is enabled and the attempt cap, if any, has not been reached.
    pub(crate) fn can_reconnect(&self) -> bool {
        if !self.options.enabled {
            return false;
        }

        match self.options.max_attempts {
            Some(max_attempts) => { self.attempts < max_attempts }
            None => { true }
        }
    }

    /// Returns the delay to wait before the next attempt and counts the attempt.
    pub(crate) fn next_delay(&mut self, jitter_sample: f64) -> Duration {
        let delay = compute_reconnect_delay(&self.options, self.attempts, jitter_sample);
        self.attempts = self.attempts.saturating_add(1);

        debug!("reconnect backoff - attempt {} will wait {:?}", self.attempts, delay);
        delay
    }

    pub(crate) fn on_connection_success(&mut self, now: Instant) {
        self.successful_connect_time = Some(now);
    }

    /// Resets the attempt count if the connection that just ended stayed up for at least the
    /// stability reset period.
    pub(crate) fn on_connection_closed(&mut self, now: Instant) {
        if let Some(successful_connect_time) = self.successful_connect_time.take() {
            if now.saturating_duration_since(successful_connect_time) >= self.options.stability_reset_period {
                debug!("reconnect backoff - connection was stable, resetting attempt count");
                self.attempts = 0;
            }
        }
    }
}
