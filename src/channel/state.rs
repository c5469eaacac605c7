//! Connection state machine and reconnect backoff

use std::time::Duration;

/// Lifecycle state of the event channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for, or making, reconnect attempt number `attempt` (from 1).
    Reconnecting { attempt: u32 },
    /// No usable credential, or the server rejected it. Terminal until
    /// the user signs in again.
    Unauthenticated,
}

/// Inputs that drive [`ChannelState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Caller asked to connect.
    Connect,
    Connected,
    ConnectFailed,
    /// An established connection was lost.
    Dropped,
    AuthRejected,
    Shutdown,
}

impl ChannelState {
    /// Next state for `input`. Inputs that make no sense in the current
    /// state leave it unchanged.
    pub fn next(self, input: Transition) -> ChannelState {
        use ChannelState::*;
        match (self, input) {
            (_, Transition::Shutdown) => Disconnected,
            (_, Transition::AuthRejected) => Unauthenticated,
            (Disconnected | Unauthenticated, Transition::Connect) => Connecting,
            (Connecting | Reconnecting { .. }, Transition::Connected) => Connected,
            (Connecting, Transition::ConnectFailed) => Reconnecting { attempt: 1 },
            (Reconnecting { attempt }, Transition::ConnectFailed) => Reconnecting {
                attempt: attempt.saturating_add(1),
            },
            (Connected, Transition::Dropped) => Reconnecting { attempt: 1 },
            (state, input) => {
                tracing::debug!("Ignoring {:?} in state {:?}", input, state);
                state
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting { .. } => "reconnecting",
            ChannelState::Unauthenticated => "unauthenticated",
        }
    }
}

/// Exponential backoff: `base * factor^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).checked_pow(exp).unwrap_or(u32::MAX);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}
