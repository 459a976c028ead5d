//! Push-channel health and reconnect policy.

use std::collections::BTreeSet;

use shared::domain::ConversationId;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Push channel unavailable; polling alone keeps the session current.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            base: settings.reconnect_base_delay,
            max: settings.reconnect_max_delay,
            max_attempts: settings.reconnect_max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    policy: BackoffPolicy,
    attempts: u32,
    reconnect_at: Option<Instant>,
    rooms: BTreeSet<ConversationId>,
    halted: bool,
}

impl ConnectionSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts: 0,
            reconnect_at: None,
            rooms: BTreeSet::new(),
            halted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns false when a connect attempt must not start now.
    pub fn begin_connect(&mut self) -> bool {
        if self.halted
            || matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return false;
        }
        self.reconnect_at = None;
        self.state = ConnectionState::Connecting;
        true
    }

    /// Marks the channel healthy and returns every room to re-subscribe.
    pub fn on_connected(&mut self) -> Vec<ConversationId> {
        if self.attempts > 0 {
            info!(attempts = self.attempts, "push channel reconnected");
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.reconnect_at = None;
        self.rooms.iter().cloned().collect()
    }

    /// Handles a failed connect or a lost channel: the state drops to
    /// `Disconnected` and the next attempt is scheduled while budget remains.
    pub fn on_channel_lost(&mut self, now: Instant) -> Option<Instant> {
        self.state = ConnectionState::Disconnected;
        if self.halted {
            return None;
        }
        if self.attempts >= self.policy.max_attempts {
            warn!(
                attempts = self.attempts,
                "push channel reconnect budget exhausted; staying on polling"
            );
            self.reconnect_at = None;
            return None;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        let at = now + delay;
        self.reconnect_at = Some(at);
        info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "scheduling push reconnect");
        Some(at)
    }

    /// Poll-only operation while the push channel is down.
    pub fn degrade(&mut self) {
        if !self.halted && self.state != ConnectionState::Connected {
            self.state = ConnectionState::Degraded;
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn reconnect_due(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now && !self.halted => {
                self.reconnect_at = None;
                true
            }
            _ => false,
        }
    }

    /// Manual retry or visibility regain: refill the attempt budget and
    /// reconnect immediately if the channel is down.
    pub fn reset_budget(&mut self, now: Instant) -> bool {
        if self.halted {
            return false;
        }
        self.attempts = 0;
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Degraded
        ) {
            self.reconnect_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Stops all reconnect activity, e.g. after the session expired.
    pub fn halt(&mut self) {
        self.halted = true;
        self.reconnect_at = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Explicit teardown; reconnecting requires `begin_connect`.
    pub fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Tracks a room; returns true when a join frame should go out now.
    pub fn join_room(&mut self, conversation_id: ConversationId) -> bool {
        let inserted = self.rooms.insert(conversation_id);
        inserted && self.is_connected()
    }

    /// Forgets a room; returns true when a leave frame should go out now.
    pub fn leave_room(&mut self, conversation_id: &ConversationId) -> bool {
        let removed = self.rooms.remove(conversation_id);
        removed && self.is_connected()
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
