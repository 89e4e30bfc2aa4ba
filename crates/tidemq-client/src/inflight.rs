//! In-flight bookkeeping for packets awaiting a reply.

use std::time::{Duration, Instant};

use tidemq_core::packet::PacketType;

/// A retained packet plus the reply it is waiting for.
///
/// `waiting_for == None` means the packet has not been sent yet.
#[derive(Debug, Clone)]
pub struct InFlight<T> {
    packet: T,
    waiting_for: Option<PacketType>,
    started: Option<Instant>,
    attempts: u32,
}

impl<T> InFlight<T> {
    pub fn new(packet: T) -> Self {
        Self {
            packet,
            waiting_for: None,
            started: None,
            attempts: 0,
        }
    }

    pub fn packet(&self) -> &T {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut T {
        &mut self.packet
    }

    pub fn into_packet(self) -> T {
        self.packet
    }

    pub fn waiting_for(&self) -> Option<PacketType> {
        self.waiting_for
    }

    pub fn set_waiting_for(&mut self, packet_type: Option<PacketType>) {
        self.waiting_for = packet_type;
    }

    pub fn start_timer(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop_timer(&mut self) {
        self.started = None;
    }

    /// Restart a running timer from zero. A stopped timer stays stopped.
    pub fn zero_timer(&mut self) {
        if self.started.is_some() {
            self.start_timer();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Forget that the packet was ever sent.
    pub fn reset(&mut self) {
        self.waiting_for = None;
        self.stop_timer();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(started) = self.started.as_mut() {
            *started = started.checked_sub(by).unwrap_or(*started);
        }
    }
}
