//! Connection state machine for the signaling link.
//!
//! Pure bookkeeping: the driver asks it what to do next and does the
//! waiting itself, so backoff behaviour is testable without timers.
//!
//! ```text
//! Disconnected --start/retry--> Connecting --connected--> Connected
//!      ^                            |                         |
//!      +-------- failure -----------+------- failure ---------+
//! any state --close--> Closed (no automatic reconnect)
//! ```

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Explicitly disconnected; stays here until `start`
    Closed,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): the base delay
    /// doubled per earlier attempt, capped at the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: LinkState,
    attempts: u32,
    /// Retry budget spent; only `start` reconnects
    exhausted: bool,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Disconnected,
            attempts: 0,
            exhausted: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Explicit (re)connect request. Clears the retry counter.
    pub fn start(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
        self.state = LinkState::Connecting;
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.exhausted = false;
        self.state = LinkState::Connected;
    }

    /// A connect attempt failed or an established link dropped.
    ///
    /// Returns the delay before the next attempt, or `None` when no retry
    /// should happen (closed, or attempts exhausted).
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.state == LinkState::Closed {
            return None;
        }
        self.state = LinkState::Disconnected;
        if self.attempts >= self.policy.max_attempts {
            self.exhausted = true;
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay(self.attempts))
    }

    /// Backoff elapsed; move on to the next attempt.
    pub fn retry(&mut self) {
        if self.state == LinkState::Disconnected && !self.exhausted {
            self.state = LinkState::Connecting;
        }
    }

    pub fn close(&mut self) {
        self.state = LinkState::Closed;
    }
}
