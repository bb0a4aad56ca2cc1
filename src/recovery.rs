//! Seam to loss detection and congestion control (RFC 9002)
//!
//! The lifecycle engine reports packets in both directions and asks two
//! questions: may it send now, and when does recovery next need the timer.

use tokio::time::Instant;

use crate::handshake::EncryptionLevel;

pub trait LossDetection: Send {
    fn on_packet_received(&mut self, level: EncryptionLevel, packet_number: u64, now: Instant);

    fn on_packet_sent(&mut self, level: EncryptionLevel, bytes: usize, ack_eliciting: bool, now: Instant);

    /// Whether `bytes` more may be put in flight
    fn can_send(&self, bytes: usize) -> bool;

    /// Next loss detection or probe deadline
    fn next_timeout(&self) -> Option<Instant>;

    /// Timer fired. Returns true if a probe packet should be sent.
    fn on_timeout(&mut self, now: Instant) -> bool;
}

/// Never limits sending and never arms a timer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLossDetection {
    packets_sent: u64,
    packets_received: u64,
}

impl NoLossDetection {
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }
}

impl LossDetection for NoLossDetection {
    fn on_packet_received(&mut self, _level: EncryptionLevel, _packet_number: u64, _now: Instant) {
        self.packets_received += 1;
    }

    fn on_packet_sent(&mut self, _level: EncryptionLevel, _bytes: usize, _ack_eliciting: bool, _now: Instant) {
        self.packets_sent += 1;
    }

    fn can_send(&self, _bytes: usize) -> bool {
        true
    }

    fn next_timeout(&self) -> Option<Instant> {
        None
    }

    fn on_timeout(&mut self, _now: Instant) -> bool {
        false
    }
}
