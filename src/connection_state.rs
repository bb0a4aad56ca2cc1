//! Connection lifecycle state machine
//!
//! States only move forward. The one loop is Draining absorbing stray
//! packets:
//!
//! ```text
//! Handshaking -> EarlyDataReady -> Active -> Closing -> Draining -> Destroyed
//! ```
//!
//! EarlyDataReady is optional and Closing is skipped when the peer closes
//! first. Any state but Destroyed can be destroyed directly.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{QuicError, Result};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Handshake in progress
    Handshaking,
    /// 0-RTT keys available, application data may flow before completion
    EarlyDataReady,
    /// Handshake complete, 1-RTT traffic
    Active,
    /// Local close sent, waiting to drain
    Closing,
    /// No more sending, only absorbing stray packets
    Draining,
    /// Terminal, all routing entries released
    Destroyed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Closing, Draining or Destroyed
    pub fn is_closed(&self) -> bool {
        *self >= Self::Closing
    }

    /// Whether application data may be sent in this state
    pub fn can_send_data(&self) -> bool {
        matches!(self, Self::EarlyDataReady | Self::Active)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshaking => "handshaking",
            Self::EarlyDataReady => "early-data-ready",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Draining => "draining",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Events that drive the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Early data keys derived and early data permitted
    EarlyDataPermitted,
    HandshakeCompleted,
    /// Local close decided, CONNECTION_CLOSE about to be sent
    CloseInitiated,
    /// CONNECTION_CLOSE handed to the writer
    CloseSent,
    /// CONNECTION_CLOSE received from the peer
    CloseReceived,
    /// Packet arrived while draining
    StrayPacket,
    /// Draining period expired
    DrainTimeout,
    /// `destroy` was called
    Destroy,
}

/// Explicit transition table with a bounded history
#[derive(Debug)]
pub struct LifecycleMachine {
    current: LifecycleState,
    history: Vec<(LifecycleState, Instant)>,
    max_history: usize,
    stray_packets: u64,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self {
            current: LifecycleState::Handshaking,
            history: vec![(LifecycleState::Handshaking, Instant::now())],
            max_history: 16,
            stray_packets: 0,
        }
    }

    pub fn current(&self) -> LifecycleState {
        self.current
    }

    /// State `event` leads to from the current state, if the transition is valid
    pub fn next_state(&self, event: StateEvent) -> Option<LifecycleState> {
        use LifecycleState::*;
        use StateEvent::*;

        let next = match (self.current, event) {
            (Handshaking, EarlyDataPermitted) => EarlyDataReady,
            (Handshaking | EarlyDataReady, HandshakeCompleted) => Active,
            (Handshaking | EarlyDataReady | Active, CloseInitiated) => Closing,
            (Handshaking | EarlyDataReady | Active, CloseReceived) => Draining,
            (Closing, CloseSent | CloseReceived) => Draining,
            (Draining, StrayPacket) => Draining,
            (Draining, DrainTimeout) => Destroyed,
            (state, Destroy) if state != Destroyed => Destroyed,
            _ => return None,
        };
        Some(next)
    }

    pub fn is_transition_valid(&self, event: StateEvent) -> bool {
        self.next_state(event).is_some()
    }

    /// Apply `event`, rejecting transitions the table does not allow
    pub fn transition(&mut self, event: StateEvent) -> Result<LifecycleState> {
        let next = self.next_state(event).ok_or_else(|| {
            QuicError::InternalConsistency(format!(
                "invalid lifecycle transition from {} on {:?}",
                self.current, event
            ))
        })?;

        if event == StateEvent::StrayPacket {
            self.stray_packets += 1;
            return Ok(next);
        }

        self.current = next;
        self.history.push((next, Instant::now()));
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
        Ok(next)
    }

    pub fn history(&self) -> &[(LifecycleState, Instant)] {
        &self.history
    }

    /// Stray packets absorbed while draining
    pub fn stray_packets(&self) -> u64 {
        self.stray_packets
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.history
            .last()
            .map(|(_, entered)| entered.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}
