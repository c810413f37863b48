//! Relay link state machine.
//!
//! [`LinkMachine`] owns the connection state and the reconnect attempt
//! counter. It performs no I/O: each [`LinkEvent`] yields the
//! [`LinkAction`]s the driver in [`crate::relay`] must carry out, in order.
//! Events that do not apply to the current state are ignored, so a late
//! transport callback can never resurrect a link that was disconnected.

use serde::Serialize;
use std::time::Duration;

/// Relay link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying.
    Idle,
    /// A transport open is in flight.
    Connecting,
    /// Transport open and device registered.
    Connected,
    /// Waiting out the retry interval.
    Reconnecting,
    /// Gave up; only an explicit connect leaves this state.
    Failed,
}

impl ConnectionState {
    /// Lowercase label used in logs and the local API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Why the link entered [`ConnectionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No endpoint configured and discovery found none.
    EndpointRequired,
    /// Every allowed retry failed.
    RetriesExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndpointRequired => f.write_str("endpoint required"),
            Self::RetriesExhausted => f.write_str("max reconnect attempts reached"),
        }
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Caller asked to connect.
    Connect,
    /// Endpoint resolution found nothing to dial.
    EndpointMissing,
    /// The transport opened.
    Opened,
    /// The transport failed to open, errored, or closed.
    Closed,
    /// The retry timer fired.
    RetryElapsed,
    /// Caller asked to disconnect.
    Disconnect,
}

/// Side effects requested by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Resolve the endpoint and open a transport.
    Open,
    /// Send `device_register` on the fresh transport.
    Register,
    /// Arm the retry timer.
    ScheduleRetry(Duration),
    /// Drop the retry timer.
    CancelRetry,
    /// Close the transport and abandon any in-flight open.
    CloseTransport,
    /// Surface a terminal failure.
    ReportFailed(FailureReason),
}

/// Connection state plus the bounded, fixed-interval retry policy.
#[derive(Debug, Clone)]
pub struct LinkMachine {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    retry_interval: Duration,
}

impl LinkMachine {
    /// Idle machine allowing `max_attempts` retries spaced `retry_interval`.
    #[must_use]
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            max_attempts,
            retry_interval,
        }
    }

    /// Replace the retry policy. Applies from the next failure on.
    pub fn set_policy(&mut self, max_attempts: u32, retry_interval: Duration) {
        self.max_attempts = max_attempts;
        self.retry_interval = retry_interval;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries issued since the last successful open or explicit connect.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Retry budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Apply `event` and return the actions to perform.
    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        use ConnectionState::{Connected, Connecting, Failed, Idle, Reconnecting};

        match (self.state, event) {
            (Idle | Failed, LinkEvent::Connect) => {
                self.attempts = 0;
                self.state = Connecting;
                vec![LinkAction::Open]
            }
            (Reconnecting, LinkEvent::Connect) => {
                self.attempts = 0;
                self.state = Connecting;
                vec![LinkAction::CancelRetry, LinkAction::Open]
            }
            (Connecting, LinkEvent::EndpointMissing) => {
                self.state = Failed;
                vec![LinkAction::ReportFailed(FailureReason::EndpointRequired)]
            }
            (Connecting, LinkEvent::Opened) => {
                self.attempts = 0;
                self.state = Connected;
                vec![LinkAction::Register]
            }
            (Connecting | Connected, LinkEvent::Closed) => {
                if self.attempts >= self.max_attempts {
                    self.state = Failed;
                    vec![
                        LinkAction::CloseTransport,
                        LinkAction::ReportFailed(FailureReason::RetriesExhausted),
                    ]
                } else {
                    self.attempts += 1;
                    self.state = Reconnecting;
                    vec![
                        LinkAction::CloseTransport,
                        LinkAction::ScheduleRetry(self.retry_interval),
                    ]
                }
            }
            (Reconnecting, LinkEvent::RetryElapsed) => {
                self.state = Connecting;
                vec![LinkAction::Open]
            }
            (Idle, LinkEvent::Disconnect) => Vec::new(),
            (_, LinkEvent::Disconnect) => {
                self.attempts = 0;
                self.state = Idle;
                vec![LinkAction::CancelRetry, LinkAction::CloseTransport]
            }
            _ => Vec::new(),
        }
    }
}
