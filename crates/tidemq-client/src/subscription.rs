//! Subscription lifecycle and inbound QoS delivery.
//!
//! Topics move through pending-subscribe, active and pending-unsubscribe.
//! Only the head of each request queue is ever on the wire; the next one
//! goes out once the head has been acknowledged.
//!
//! Inbound publishes are delivered according to their QoS:
//! - QoS 0: delivered immediately
//! - QoS 1: delivered, then acknowledged with PUBACK
//! - QoS 2: recorded and answered with PUBREC; delivered once on PUBREL

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, error, warn};

use tidemq_core::packet::{
    Packet, PacketType, Publish, QoS, Suback, Subscribe, Unsubscribe, SUBACK_FAILURE,
};
use tidemq_core::next_packet_id;

use crate::context::{send, ClientContext};
use crate::inflight::InFlight;
use crate::retry::RetryPolicy;

#[derive(Debug)]
pub struct Subscription {
    /// QoS 2 publishes awaiting PUBREL, by packet id.
    receiving: AHashMap<u16, InFlight<Publish>>,
    subscribing: VecDeque<InFlight<Subscribe>>,
    active: AHashMap<String, QoS>,
    unsubscribing: VecDeque<InFlight<Unsubscribe>>,
    ack_timeout: Duration,
    retry: RetryPolicy,
}

impl Subscription {
    pub fn new(ack_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            receiving: AHashMap::new(),
            subscribing: VecDeque::new(),
            active: AHashMap::new(),
            unsubscribing: VecDeque::new(),
            ack_timeout,
            retry,
        }
    }

    /// Queue a subscription. Already active at the same QoS is a no-op.
    pub fn subscribe(&mut self, topic: &str, qos: QoS) {
        if self.active.get(topic) == Some(&qos) {
            return;
        }
        self.subscribing.push_back(InFlight::new(Subscribe {
            packet_id: next_packet_id(),
            topics: vec![(topic.to_string(), qos)],
        }));
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        self.unsubscribing.push_back(InFlight::new(Unsubscribe {
            packet_id: next_packet_id(),
            topics: vec![topic.to_string()],
        }));
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.active.contains_key(topic)
    }

    /// Granted QoS of an active subscription.
    pub fn granted_qos(&self, topic: &str) -> Option<QoS> {
        self.active.get(topic).copied()
    }

    pub fn pending_requests(&self) -> usize {
        self.subscribing.len() + self.unsubscribing.len()
    }

    /// QoS 2 receipts still waiting for PUBREL.
    pub fn awaiting_release(&self) -> usize {
        self.receiving.len()
    }

    /// Advance the request queues and redeliver overdue PUBRECs.
    ///
    /// Called once per client tick.
    pub fn subscribe_next<C: ClientContext + ?Sized>(&mut self, ctx: &mut C) {
        let ack_timeout = self.ack_timeout;
        let all_ok = send_head(&mut self.subscribing, PacketType::Suback, ack_timeout, ctx, "subscription")
            && send_head(&mut self.unsubscribing, PacketType::Unsuback, ack_timeout, ctx, "unsubscription");
        if !all_ok {
            return;
        }

        for (packet_id, flight) in self.receiving.iter_mut() {
            if flight.waiting_for() != Some(PacketType::Pubrel) {
                continue;
            }
            if flight.elapsed() <= self.retry.delay(flight.attempts() + 1) {
                continue;
            }
            if self.retry.is_exhausted(flight.attempts()) {
                error!(
                    "No PUBREL for packet {} after {} attempts, forcing disconnect",
                    packet_id,
                    flight.attempts()
                );
                flight.stop_timer();
                ctx.force_disconnect();
                return;
            }

            // If the PUBREC can't be queued another try happens next tick
            if send(ctx, &Packet::Pubrec { packet_id: *packet_id }) {
                debug!("Resent PUBREC for packet {}", packet_id);
                flight.record_attempt();
                flight.start_timer();
            }
        }
    }

    /// Reset in-progress requests so they are resent on the next connection.
    ///
    /// Active subscriptions go back to pending since the broker does not
    /// keep them without a persistent session.
    pub fn handle_disconnect(&mut self) {
        if let Some(head) = self.subscribing.front_mut() {
            head.reset();
        }

        for (topic, qos) in std::mem::take(&mut self.active) {
            // A queued request for the same topic supersedes the old one
            let queued = self
                .subscribing
                .iter()
                .any(|flight| flight.packet().topics.iter().any(|(t, _)| *t == topic));
            if !queued {
                self.subscribe(&topic, qos);
            }
        }

        if let Some(head) = self.unsubscribing.front_mut() {
            head.reset();
        }

        for flight in self.receiving.values_mut() {
            flight.reset_attempts();
            flight.start_timer();
        }
    }

    pub fn receive_suback(&mut self, suback: &Suback) {
        let Some(head) = self.subscribing.front() else {
            return;
        };
        if head.waiting_for() != Some(PacketType::Suback)
            || head.packet().packet_id != suback.packet_id
        {
            return;
        }

        if let Some(flight) = self.subscribing.pop_front() {
            let topics = flight.into_packet().topics;
            for (i, (topic, requested)) in topics.into_iter().enumerate() {
                let code = suback.return_codes.get(i).copied();
                match code.map(QoS::try_from) {
                    Some(Ok(granted)) => {
                        debug!("Subscription of topic {} completed, QoS: {:?}", topic, granted);
                        self.active.insert(topic, granted);
                    }
                    Some(Err(_)) if code == Some(SUBACK_FAILURE) => {
                        warn!("Broker refused subscription of topic {}", topic);
                    }
                    _ => {
                        warn!(
                            "Bad return code {:?} for topic {}, assuming {:?}",
                            code, topic, requested
                        );
                        self.active.insert(topic, requested);
                    }
                }
            }
        }
    }

    pub fn receive_unsuback(&mut self, packet_id: u16) {
        let Some(head) = self.unsubscribing.front() else {
            return;
        };
        if head.waiting_for() != Some(PacketType::Unsuback) || head.packet().packet_id != packet_id
        {
            return;
        }

        if let Some(flight) = self.unsubscribing.pop_front() {
            for topic in flight.into_packet().topics {
                debug!("Unsubscription of topic {} completed", topic);
                self.active.remove(&topic);
            }
        }
    }

    /// Inbound PUBLISH.
    ///
    /// A publish may legitimately arrive before the SUBACK of its subscription.
    pub fn receive_publish<C: ClientContext + ?Sized>(&mut self, publish: &Publish, ctx: &mut C) {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => forward_to_application(publish, ctx),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                forward_to_application(publish, ctx);
                send(ctx, &Packet::Puback { packet_id });
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.receiving.entry(packet_id).or_insert_with(|| {
                    let mut flight = InFlight::new(publish.clone());
                    flight.set_waiting_for(Some(PacketType::Pubrel));
                    flight.start_timer();
                    flight
                });
                // Always acknowledge, duplicates included
                send(ctx, &Packet::Pubrec { packet_id });
            }
            (qos, None) => warn!("QoS {:?} publish without packet id, dropped", qos),
        }
    }

    /// Inbound PUBREL. Delivers the held message the first time only.
    pub fn receive_pubrel<C: ClientContext + ?Sized>(&mut self, packet_id: u16, ctx: &mut C) {
        send(ctx, &Packet::Pubcomp { packet_id });

        // Removal makes a repeated PUBREL a no-op; a later PUBLISH with the
        // same id starts over as a new message
        if let Some(flight) = self.receiving.remove(&packet_id) {
            forward_to_application(flight.packet(), ctx);
        }
    }
}

fn forward_to_application<C: ClientContext + ?Sized>(publish: &Publish, ctx: &mut C) {
    debug!("Reception of QoS {:?} complete", publish.qos);
    ctx.deliver(publish);
}

/// Put the head request on the wire, or give up on the connection when its
/// acknowledgement is overdue. False when a disconnect was forced.
fn send_head<T, C>(
    queue: &mut VecDeque<InFlight<T>>,
    wait_for: PacketType,
    ack_timeout: Duration,
    ctx: &mut C,
    kind: &str,
) -> bool
where
    T: Clone + Into<Packet>,
    C: ClientContext + ?Sized,
{
    let Some(head) = queue.front_mut() else {
        return true;
    };

    if head.waiting_for().is_none() {
        if send(ctx, &head.packet().clone().into()) {
            head.start_timer();
            head.set_waiting_for(Some(wait_for));
        }
    } else if head.elapsed() > ack_timeout {
        error!(
            "Too long since a reply was received to a {} request, forcing disconnect",
            kind
        );
        head.stop_timer();
        ctx.force_disconnect();
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::context::testing::Recorder;

    fn engine() -> Subscription {
        Subscription::new(Duration::from_secs(5), RetryPolicy::default())
    }

    fn publish(qos: QoS, packet_id: Option<u16>, payload: &'static str) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: Bytes::from_static(b"sensors/temp"),
            packet_id,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    fn sent_subscribe(packet: &Packet) -> &Subscribe {
        match packet {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
    }

    fn ack(sub: &Subscribe) -> Suback {
        Suback {
            packet_id: sub.packet_id,
            return_codes: sub.topics.iter().map(|(_, qos)| *qos as u8).collect(),
        }
    }

    #[test]
    fn test_qos0_delivered_without_ack() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.receive_publish(&publish(QoS::AtMostOnce, None, "a"), &mut ctx);
        assert_eq!(ctx.delivered.len(), 1);
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_qos1_delivers_before_puback() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.receive_publish(&publish(QoS::AtLeastOnce, Some(17), "a"), &mut ctx);

        assert_eq!(ctx.sent, vec![Packet::Puback { packet_id: 17 }]);
        assert_eq!(ctx.delivered.len(), 1);
        assert_eq!(ctx.log, vec!["deliver", "send"]);
    }

    #[test]
    fn test_qos1_duplicates_are_not_filtered() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        let msg = publish(QoS::AtLeastOnce, Some(3), "a");
        sub.receive_publish(&msg, &mut ctx);
        sub.receive_publish(&msg, &mut ctx);
        assert_eq!(ctx.delivered.len(), 2);
        assert_eq!(ctx.sent.len(), 2);
    }

    #[test]
    fn test_qos2_exactly_once() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        let first = publish(QoS::ExactlyOnce, Some(9), "first");
        let mut dup = publish(QoS::ExactlyOnce, Some(9), "retransmit");
        dup.dup = true;

        sub.receive_publish(&first, &mut ctx);
        sub.receive_publish(&dup, &mut ctx);
        assert!(ctx.delivered.is_empty());
        assert_eq!(
            ctx.take_sent(),
            vec![Packet::Pubrec { packet_id: 9 }, Packet::Pubrec { packet_id: 9 }]
        );

        sub.receive_pubrel(9, &mut ctx);
        assert_eq!(ctx.delivered, vec![first]);
        assert_eq!(ctx.take_sent(), vec![Packet::Pubcomp { packet_id: 9 }]);

        // Redundant PUBREL is answered but not delivered again
        sub.receive_pubrel(9, &mut ctx);
        assert_eq!(ctx.delivered.len(), 1);
        assert_eq!(ctx.take_sent(), vec![Packet::Pubcomp { packet_id: 9 }]);
        assert_eq!(sub.awaiting_release(), 0);
    }

    #[test]
    fn test_unknown_pubrel_still_answered() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.receive_pubrel(44, &mut ctx);
        assert_eq!(ctx.sent, vec![Packet::Pubcomp { packet_id: 44 }]);
        assert!(ctx.delivered.is_empty());
    }

    #[test]
    fn test_subscription_head_of_line() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.subscribe("a", QoS::AtLeastOnce);
        sub.subscribe("b", QoS::AtMostOnce);

        sub.subscribe_next(&mut ctx);
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        let first = sent_subscribe(&sent[0]).clone();
        assert_eq!(first.topics, vec![("a".to_string(), QoS::AtLeastOnce)]);

        // An ack for some other id changes nothing
        sub.receive_suback(&Suback {
            packet_id: first.packet_id.wrapping_add(1000),
            return_codes: vec![1],
        });
        sub.subscribe_next(&mut ctx);
        assert!(ctx.take_sent().is_empty());

        sub.receive_suback(&ack(&first));
        assert!(sub.is_subscribed("a"));

        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent_subscribe(&sent[0]).topics,
            vec![("b".to_string(), QoS::AtMostOnce)]
        );
    }

    #[test]
    fn test_suback_failure_code_leaves_topic_inactive() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.subscribe("denied", QoS::AtLeastOnce);
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        let request = sent_subscribe(&sent[0]);

        sub.receive_suback(&Suback {
            packet_id: request.packet_id,
            return_codes: vec![SUBACK_FAILURE],
        });
        assert!(!sub.is_subscribed("denied"));
        assert_eq!(sub.pending_requests(), 0);
    }

    #[test]
    fn test_granted_qos_is_recorded() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.subscribe("t", QoS::ExactlyOnce);
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        let request = sent_subscribe(&sent[0]);

        sub.receive_suback(&Suback {
            packet_id: request.packet_id,
            return_codes: vec![1],
        });
        assert_eq!(sub.granted_qos("t"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn test_unsubscribe_removes_active_topic() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.subscribe("t", QoS::AtMostOnce);
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        sub.receive_suback(&ack(sent_subscribe(&sent[0])));

        sub.unsubscribe("t");
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        let packet_id = match &sent[0] {
            Packet::Unsubscribe(unsubscribe) => unsubscribe.packet_id,
            other => panic!("expected UNSUBSCRIBE, got {:?}", other),
        };

        sub.receive_unsuback(packet_id);
        assert!(!sub.is_subscribed("t"));
    }

    #[test]
    fn test_unsuback_before_resend_is_ignored() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.subscribe("t", QoS::AtMostOnce);
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        sub.receive_suback(&ack(sent_subscribe(&sent[0])));

        sub.unsubscribe("t");
        sub.subscribe_next(&mut ctx);
        let packet_id = match &ctx.take_sent()[0] {
            Packet::Unsubscribe(unsubscribe) => unsubscribe.packet_id,
            other => panic!("expected UNSUBSCRIBE, got {:?}", other),
        };

        // The request has not gone out on the new connection yet
        sub.handle_disconnect();
        sub.receive_unsuback(packet_id);
        assert_eq!(sub.unsubscribing.len(), 1);
    }

    #[test]
    fn test_disconnect_requeues_everything() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.subscribe("active", QoS::AtLeastOnce);
        sub.subscribe_next(&mut ctx);
        let sent = ctx.take_sent();
        sub.receive_suback(&ack(sent_subscribe(&sent[0])));

        sub.subscribe("pending", QoS::AtMostOnce);
        sub.subscribe_next(&mut ctx);
        let in_flight = ctx.take_sent();
        assert_eq!(in_flight.len(), 1);

        sub.handle_disconnect();
        assert!(!sub.is_subscribed("active"));
        assert_eq!(sub.pending_requests(), 2);

        // The interrupted request goes out again first, with its original id
        sub.subscribe_next(&mut ctx);
        assert_eq!(ctx.take_sent(), in_flight);
    }

    #[test]
    fn test_missing_suback_forces_disconnect() {
        let mut sub = Subscription::new(Duration::from_secs(5), RetryPolicy::default());
        let mut ctx = Recorder::default();
        sub.subscribe("t", QoS::AtMostOnce);
        sub.subscribe_next(&mut ctx);

        sub.subscribing.front_mut().unwrap().backdate(Duration::from_secs(6));
        sub.subscribe_next(&mut ctx);
        assert_eq!(ctx.forced, 1);
    }

    #[test]
    fn test_overdue_pubrec_is_resent() {
        let mut sub = engine();
        let mut ctx = Recorder::default();
        sub.receive_publish(&publish(QoS::ExactlyOnce, Some(5), "x"), &mut ctx);
        ctx.take_sent();

        sub.subscribe_next(&mut ctx);
        assert!(ctx.take_sent().is_empty());

        sub.receiving.get_mut(&5).unwrap().backdate(Duration::from_secs(6));
        sub.subscribe_next(&mut ctx);
        assert_eq!(ctx.take_sent(), vec![Packet::Pubrec { packet_id: 5 }]);

        // Timer restarted
        sub.subscribe_next(&mut ctx);
        assert!(ctx.take_sent().is_empty());
    }

    #[test]
    fn test_pubrec_retries_are_bounded() {
        let retry = RetryPolicy::default().max_attempts(2);
        let mut sub = Subscription::new(Duration::from_secs(5), retry);
        let mut ctx = Recorder::default();
        sub.receive_publish(&publish(QoS::ExactlyOnce, Some(8), "x"), &mut ctx);

        for _ in 0..2 {
            sub.receiving.get_mut(&8).unwrap().backdate(Duration::from_secs(6));
            sub.subscribe_next(&mut ctx);
        }
        assert_eq!(ctx.forced, 0);

        sub.receiving.get_mut(&8).unwrap().backdate(Duration::from_secs(6));
        sub.subscribe_next(&mut ctx);
        assert_eq!(ctx.forced, 1);

        // The count starts over on the next connection
        sub.handle_disconnect();
        assert_eq!(sub.receiving[&8].attempts(), 0);
    }
}
