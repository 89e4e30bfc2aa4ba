//! What the delivery engines need from the client that drives them.

use log::error;
use tidemq_core::packet::{Packet, Publish};
use tidemq_core::MqttPacket;

/// Outbound side of a client, as seen by the engines.
pub trait ClientContext {
    /// Queue a frame for transmission. False when the queue is full or the
    /// frame is invalid.
    fn send_packet(&mut self, packet: MqttPacket) -> bool;

    /// Hand a received message to the application.
    fn deliver(&mut self, publish: &Publish);

    /// Give up on the connection.
    fn force_disconnect(&mut self);
}

/// Encode and queue a packet.
pub fn send<C: ClientContext + ?Sized>(ctx: &mut C, packet: &Packet) -> bool {
    match packet.encode() {
        Ok(frame) => ctx.send_packet(frame),
        Err(e) => {
            error!("Failed to encode {}: {}", packet.packet_type().as_str(), e);
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records everything the engines do.
    pub(crate) struct Recorder {
        pub sent: Vec<Packet>,
        pub frames: Vec<MqttPacket>,
        pub delivered: Vec<Publish>,
        /// Interleaving of sends and deliveries.
        pub log: Vec<&'static str>,
        pub forced: usize,
        /// Accept at most this many more packets.
        pub capacity: usize,
    }

    impl Default for Recorder {
        fn default() -> Self {
            Self {
                sent: Vec::new(),
                frames: Vec::new(),
                delivered: Vec::new(),
                log: Vec::new(),
                forced: 0,
                capacity: usize::MAX,
            }
        }
    }

    impl Recorder {
        pub(crate) fn take_sent(&mut self) -> Vec<Packet> {
            self.frames.clear();
            std::mem::take(&mut self.sent)
        }
    }

    impl ClientContext for Recorder {
        fn send_packet(&mut self, packet: MqttPacket) -> bool {
            if self.capacity == 0 {
                return false;
            }
            self.capacity -= 1;
            self.sent.push(Packet::decode(&packet).unwrap());
            self.frames.push(packet);
            self.log.push("send");
            true
        }

        fn deliver(&mut self, publish: &Publish) {
            self.delivered.push(publish.clone());
            self.log.push("deliver");
        }

        fn force_disconnect(&mut self) {
            self.forced += 1;
        }
    }
}
