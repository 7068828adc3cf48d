// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection state and reconnect backoff for remote dependencies.
//!
//! Each dependency service owns one [`Link`]. The link is the only place the
//! connection state changes, so there is never more than one reconnect in
//! flight for a dependency.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(state)
    }
}

/// Exponential reconnect backoff. Each failure doubles the wait, capped at
/// `max`; a success resets it to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_retry_at: Instant,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            next_retry_at: Instant::now(),
        }
    }

    /// Records a failure and schedules the next retry. Returns the wait
    /// that was applied.
    pub fn mark_failure(&mut self, now: Instant) -> Duration {
        let wait = self.current;
        self.next_retry_at = now + wait;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    pub fn mark_success(&mut self, now: Instant) {
        self.current = self.initial;
        self.next_retry_at = now;
    }

    pub fn should_retry(&self, now: Instant) -> bool {
        now >= self.next_retry_at
    }

    /// Time left until the next retry is allowed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_retry_at.saturating_duration_since(now)
    }

    /// Wait that the next failure will apply.
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Connection state machine for one dependency.
///
/// ```text
/// Disconnected --begin_connect--> Connecting --connected--> Connected
///       ^                              |                        |
///       +-----------failed-------------+---------failed---------+
/// ```
#[derive(Debug, Clone)]
pub struct Link {
    name: &'static str,
    state: ConnectionState,
    backoff: Backoff,
}

impl Link {
    pub fn new(name: &'static str, backoff: Backoff) -> Self {
        Self {
            name,
            state: ConnectionState::Disconnected,
            backoff,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether a connection attempt may be made now. Always false while
    /// connected; while disconnected, false until the backoff window has
    /// elapsed.
    pub fn can_attempt(&self, now: Instant) -> bool {
        self.state == ConnectionState::Disconnected && self.backoff.should_retry(now)
    }

    pub fn retry_in(&self, now: Instant) -> Duration {
        self.backoff.remaining(now)
    }

    pub fn begin_connect(&mut self) {
        debug!("{}: connecting", self.name);
        self.state = ConnectionState::Connecting;
    }

    pub fn connected(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected {
            debug!("{}: connected", self.name);
        }
        self.state = ConnectionState::Connected;
        self.backoff.mark_success(now);
    }

    /// Moves to `Disconnected` and opens a backoff window.
    pub fn failed(&mut self, now: Instant, reason: &dyn fmt::Display) {
        let previous = self.state;
        let wait = self.backoff.mark_failure(now);
        self.state = ConnectionState::Disconnected;
        warn!(
            "{}: {reason} (was {previous}, retrying in {}ms)",
            self.name,
            wait.as_millis()
        );
    }
}
