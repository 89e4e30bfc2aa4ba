//! Outbound publishes and their QoS handshakes.
//!
//! Publishes are queued and sent strictly one at a time: the head of the
//! queue must be fully acknowledged (PUBACK for QoS 1, PUBREC/PUBREL/PUBCOMP
//! for QoS 2) before the next one goes out.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace};

use tidemq_core::packet::{Packet, PacketType, Publish, QoS};
use tidemq_core::{next_packet_id, MqttPacket};

use crate::context::{send, ClientContext};
use crate::error::{ClientError, Result};
use crate::inflight::InFlight;

/// A publish serialized once, when it was queued.
#[derive(Debug, Clone)]
pub struct Outgoing {
    packet_id: Option<u16>,
    qos: QoS,
    frame: Bytes,
    dup: bool,
}

impl Outgoing {
    fn new(publish: Publish) -> tidemq_core::Result<Self> {
        let packet_id = publish.packet_id;
        let qos = publish.qos;
        let frame = Packet::Publish(publish).encode()?.freeze();
        Ok(Self {
            packet_id,
            qos,
            frame,
            dup: false,
        })
    }

    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Frame to put on the wire, with DUP set on redelivery.
    fn to_frame(&self) -> MqttPacket {
        let mut frame = MqttPacket::from(self.frame.clone());
        if self.dup {
            frame.set_dup_flag();
        }
        frame
    }

    fn matches(&self, packet_id: u16) -> bool {
        self.packet_id == Some(packet_id)
    }
}

#[derive(Debug)]
pub struct Publication {
    in_progress: VecDeque<InFlight<Outgoing>>,
    capacity: usize,
    ack_timeout: Duration,
}

impl Publication {
    pub fn new(capacity: usize, ack_timeout: Duration) -> Self {
        Self {
            in_progress: VecDeque::with_capacity(capacity),
            capacity,
            ack_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty()
    }

    /// Queue a message for publishing.
    pub fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        if self.in_progress.len() >= self.capacity {
            return Err(ClientError::QueueFull);
        }

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            packet_id: (qos != QoS::AtMostOnce).then(next_packet_id),
            payload,
        };
        let outgoing = Outgoing::new(publish)?;
        self.in_progress.push_back(InFlight::new(outgoing));
        Ok(())
    }

    /// Move the head of the queue along. Called once per client tick.
    pub fn publish_next<C: ClientContext + ?Sized>(&mut self, ctx: &mut C) {
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };
        let qos = flight.packet().qos();

        if qos == QoS::AtMostOnce {
            // Fire and forget
            if ctx.send_packet(flight.packet().to_frame()) {
                trace!("QoS {:?} publish completed", qos);
                self.in_progress.pop_front();
            } else {
                error!("Could not enqueue packet of QoS {:?}", qos);
            }
        } else if flight.waiting_for().is_none() {
            let wait_for = if qos == QoS::AtLeastOnce {
                PacketType::Puback
            } else {
                PacketType::Pubrec
            };
            if ctx.send_packet(flight.packet().to_frame()) {
                flight.start_timer();
                flight.set_waiting_for(Some(wait_for));
            } else {
                error!("Could not enqueue packet of QoS {:?}", qos);
            }
        } else if flight.elapsed() > self.ack_timeout {
            error!("Too long since a reply was received to a publish message, forcing disconnect");
            flight.stop_timer();
            ctx.force_disconnect();
        } else {
            trace!(
                "Waiting to send: QoS {:?}, waiting for: {:?}, timer: {}ms",
                qos,
                flight.waiting_for(),
                flight.elapsed().as_millis()
            );
        }
    }

    pub fn receive_puback(&mut self, packet_id: u16) {
        if self.head_awaits(PacketType::Puback, packet_id) {
            debug!("QoS 1 publish {} completed", packet_id);
            self.in_progress.pop_front();
        }
    }

    pub fn receive_pubrec<C: ClientContext + ?Sized>(&mut self, packet_id: u16, ctx: &mut C) {
        if !self.head_awaits(PacketType::Pubrec, packet_id) {
            return;
        }
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };

        flight.start_timer();
        // If PUBREL can't be queued the head times out and is resent after reconnecting
        if send(ctx, &Packet::Pubrel { packet_id }) {
            flight.set_waiting_for(Some(PacketType::Pubcomp));
        }
    }

    pub fn receive_pubcomp(&mut self, packet_id: u16) {
        if self.head_awaits(PacketType::Pubcomp, packet_id) {
            debug!("QoS 2 publish {} completed", packet_id);
            self.in_progress.pop_front();
        }
    }

    /// Keep the head from timing out before it has had a chance to be resent.
    pub fn handle_disconnect(&mut self) {
        if let Some(flight) = self.in_progress.front_mut() {
            flight.zero_timer();
        }
    }

    /// Deal with a head left over from the previous connection.
    ///
    /// With a clean session the broker forgot it, so a head that was
    /// already on the wire is dropped. Otherwise it is resent with its
    /// original packet id.
    pub fn resend_outstanding_control_packet<C: ClientContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        clean_session: bool,
    ) {
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };
        let waiting_for = flight.waiting_for();

        if clean_session {
            if waiting_for.is_some() {
                debug!("Dropping publish left over from previous session");
                self.in_progress.pop_front();
            }
            return;
        }

        match waiting_for {
            Some(PacketType::Puback) => {
                flight.packet_mut().dup = true;
                flight.reset();
            }
            Some(PacketType::Pubrec) => flight.reset(),
            Some(PacketType::Pubcomp) => {
                if let Some(packet_id) = flight.packet().packet_id() {
                    // The transmit queue was emptied on disconnect, so this fits
                    send(ctx, &Packet::Pubrel { packet_id });
                    flight.start_timer();
                }
            }
            _ => flight.reset(),
        }
    }

    fn head_awaits(&self, packet_type: PacketType, packet_id: u16) -> bool {
        self.in_progress.front().is_some_and(|flight| {
            flight.waiting_for() == Some(packet_type) && flight.packet().matches(packet_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::testing::Recorder;

    fn engine() -> Publication {
        Publication::new(10, Duration::from_secs(5))
    }

    fn sent_publish(packet: &Packet) -> &Publish {
        match packet {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut publication = Publication::new(2, Duration::from_secs(5));
        assert!(publication.publish("t", Bytes::from_static(b"1"), QoS::AtLeastOnce, false).is_ok());
        assert!(publication.publish("t", Bytes::from_static(b"2"), QoS::AtLeastOnce, false).is_ok());
        assert!(matches!(
            publication.publish("t", Bytes::from_static(b"3"), QoS::AtLeastOnce, false),
            Err(ClientError::QueueFull)
        ));
        assert_eq!(publication.len(), 2);
    }

    #[test]
    fn test_qos0_sent_and_dropped() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"x"), QoS::AtMostOnce, true).unwrap();
        publication.publish_next(&mut ctx);

        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        let publish = sent_publish(&sent[0]);
        assert_eq!(publish.packet_id, None);
        assert!(publish.retain);
        assert!(publication.is_empty());
    }

    #[test]
    fn test_qos0_kept_when_queue_full() {
        let mut publication = engine();
        let mut ctx = Recorder {
            capacity: 0,
            ..Default::default()
        };
        publication.publish("t", Bytes::from_static(b"x"), QoS::AtMostOnce, false).unwrap();
        publication.publish_next(&mut ctx);
        assert_eq!(publication.len(), 1);
    }

    #[test]
    fn test_qos1_flow() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::AtLeastOnce, false).unwrap();
        publication.publish("t", Bytes::from_static(b"b"), QoS::AtLeastOnce, false).unwrap();

        publication.publish_next(&mut ctx);
        publication.publish_next(&mut ctx);
        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        let packet_id = sent_publish(&sent[0]).packet_id.unwrap();

        publication.receive_puback(packet_id.wrapping_add(1));
        assert_eq!(publication.len(), 2);

        publication.receive_puback(packet_id);
        assert_eq!(publication.len(), 1);

        publication.publish_next(&mut ctx);
        let sent = ctx.take_sent();
        assert_eq!(sent_publish(&sent[0]).payload, Bytes::from_static(b"b"));
    }

    #[test]
    fn test_qos2_flow() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::ExactlyOnce, false).unwrap();
        publication.publish_next(&mut ctx);
        let sent = ctx.take_sent();
        let packet_id = sent_publish(&sent[0]).packet_id.unwrap();

        // PUBCOMP before PUBREC is out of order
        publication.receive_pubcomp(packet_id);
        assert_eq!(publication.len(), 1);

        publication.receive_pubrec(packet_id, &mut ctx);
        assert_eq!(ctx.take_sent(), vec![Packet::Pubrel { packet_id }]);

        publication.receive_pubcomp(packet_id);
        assert!(publication.is_empty());
    }

    #[test]
    fn test_missing_ack_forces_disconnect() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::AtLeastOnce, false).unwrap();
        publication.publish_next(&mut ctx);

        publication.in_progress[0].backdate(Duration::from_secs(6));
        publication.publish_next(&mut ctx);
        assert_eq!(ctx.forced, 1);
    }

    #[test]
    fn test_disconnect_zeroes_timer() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::AtLeastOnce, false).unwrap();
        publication.publish_next(&mut ctx);
        publication.in_progress[0].backdate(Duration::from_secs(4));

        publication.handle_disconnect();
        publication.in_progress[0].backdate(Duration::from_secs(2));
        publication.publish_next(&mut ctx);
        assert_eq!(ctx.forced, 0);
    }

    #[test]
    fn test_resend_with_persistent_session_sets_dup() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::AtLeastOnce, false).unwrap();
        publication.publish_next(&mut ctx);
        let first = ctx.take_sent();
        assert!(!sent_publish(&first[0]).dup);

        publication.handle_disconnect();
        publication.resend_outstanding_control_packet(&mut ctx, false);
        assert!(ctx.take_sent().is_empty());

        publication.publish_next(&mut ctx);
        let again = ctx.take_sent();
        let resent = sent_publish(&again[0]);
        assert!(resent.dup);
        assert_eq!(resent.packet_id, sent_publish(&first[0]).packet_id);
    }

    #[test]
    fn test_resend_awaiting_pubcomp_sends_pubrel() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::ExactlyOnce, false).unwrap();
        publication.publish_next(&mut ctx);
        let sent = ctx.take_sent();
        let packet_id = sent_publish(&sent[0]).packet_id.unwrap();
        publication.receive_pubrec(packet_id, &mut ctx);
        ctx.take_sent();

        publication.resend_outstanding_control_packet(&mut ctx, false);
        assert_eq!(ctx.take_sent(), vec![Packet::Pubrel { packet_id }]);
        publication.receive_pubcomp(packet_id);
        assert!(publication.is_empty());
    }

    #[test]
    fn test_clean_session_drops_sent_head() {
        let mut publication = engine();
        let mut ctx = Recorder::default();
        publication.publish("t", Bytes::from_static(b"a"), QoS::ExactlyOnce, false).unwrap();
        publication.publish("t", Bytes::from_static(b"b"), QoS::AtLeastOnce, false).unwrap();
        publication.publish_next(&mut ctx);

        publication.resend_outstanding_control_packet(&mut ctx, true);
        assert_eq!(publication.len(), 1);

        // An unsent head survives
        publication.resend_outstanding_control_packet(&mut ctx, true);
        assert_eq!(publication.len(), 1);
    }
}
