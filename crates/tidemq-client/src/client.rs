//! MQTT client.
//!
//! The client runs as a task on its own thread. The task owns the broker
//! socket and the connection state machine; the delivery engines are shared
//! with the application behind a mutex so publishes and subscriptions can be
//! queued from any thread.
//!
//! ```text
//!   Idle --socket connected--> ConnectToBroker --CONNACK ok--> Run
//!    ^                              |                           |
//!    |                          refused                  disconnect()
//!    |                              v                           v
//!    +------------------------- Idle <----linger/drained--- Disconnect
//!
//!   any connected state --socket lost--> Disconnected --timer--> reconnect
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, never, select, tick, unbounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use tidemq_core::packet::{Connack, ConnackCode, Connect, Packet, Publish, QoS};
use tidemq_core::{MqttPacket, MqttProtocol};
use tidemq_net::{
    Broker, ConnectionStatus, DispatcherHandle, NetworkStatus, SocketEvent, SocketHandle,
};

use crate::config::ClientConfig;
use crate::context::{send, ClientContext};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, ClientState, Message};
use crate::publication::Publication;
use crate::subscription::Subscription;

/// Reason reported when the application asked to disconnect.
const DISCONNECT_REQUESTED: &str = "Disconnect requested";

/// Reason reported when a delivery engine gave up on the broker.
const DISCONNECT_FORCED: &str = "Broker stopped acknowledging";

const NO_CONNACK: &str = "No CONNACK from broker";

struct Engines {
    publication: Publication,
    subscription: Subscription,
}

struct Shared {
    engines: Mutex<Engines>,
    connected: AtomicBool,
}

enum Control {
    Connect {
        address: String,
        auto_reconnect: bool,
    },
    Disconnect,
    Shutdown,
}

/// MQTT client handle.
///
/// Dropping the handle stops the client task and closes the connection
/// without a DISCONNECT; call [`Client::disconnect`] first for a clean close.
pub struct Client {
    shared: Arc<Shared>,
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Start a client task on `dispatcher`.
    ///
    /// Returns the handle and the channel carrying [`ClientEvent`]s.
    pub fn new(
        config: ClientConfig,
        dispatcher: DispatcherHandle,
    ) -> Result<(Self, Receiver<ClientEvent>)> {
        Self::start(config, dispatcher, None)
    }

    /// Like [`Client::new`], also reconnecting as soon as `network` reports
    /// [`NetworkStatus::Up`].
    pub fn with_network(
        config: ClientConfig,
        dispatcher: DispatcherHandle,
        network: &Broker,
    ) -> Result<(Self, Receiver<ClientEvent>)> {
        Self::start(config, dispatcher, Some(network.subscribe::<NetworkStatus>()))
    }

    fn start(
        config: ClientConfig,
        dispatcher: DispatcherHandle,
        network: Option<Receiver<NetworkStatus>>,
    ) -> Result<(Self, Receiver<ClientEvent>)> {
        if config.client_id.is_empty() && !config.clean_session {
            return Err(ClientError::InvalidState(
                "An empty client id requires a clean session".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            engines: Mutex::new(Engines {
                publication: Publication::new(config.max_outgoing, config.ack_timeout),
                subscription: Subscription::new(config.ack_timeout, config.retry.clone()),
            }),
            connected: AtomicBool::new(false),
        });
        let (control_tx, control_rx) = unbounded();
        let (events_tx, events_rx) = bounded(config.event_queue_size.max(1));

        let name = if config.client_id.is_empty() {
            "tidemq-client".to_string()
        } else {
            format!("tidemq-client-{}", config.client_id)
        };
        let auto_reconnect = config.auto_reconnect;
        let task = Task {
            config,
            shared: Arc::clone(&shared),
            dispatcher,
            control: control_rx,
            network,
            events: events_tx,
            socket: None,
            socket_events: None,
            address: None,
            state: ClientState::Idle,
            auto_reconnect,
            ping: None,
            connect_started: Instant::now(),
            disconnect_reason: DISCONNECT_REQUESTED,
            reconnect_at: None,
            reconnect_attempts: 0,
            running: true,
        };
        let thread = thread::Builder::new().name(name).spawn(move || task.run())?;

        Ok((
            Self {
                shared,
                control: control_tx,
                thread: Some(thread),
            },
            events_rx,
        ))
    }

    /// Connect to `address` (`host:port`).
    ///
    /// With `auto_reconnect` the client keeps reconnecting after the
    /// connection drops until [`Client::disconnect`] is called.
    pub fn connect_to(&self, address: impl Into<String>, auto_reconnect: bool) -> Result<()> {
        self.control(Control::Connect {
            address: address.into(),
            auto_reconnect,
        })
    }

    /// Send DISCONNECT and close the connection once it has gone out.
    pub fn disconnect(&self) -> Result<()> {
        self.control(Control::Disconnect)
    }

    /// Queue a message for publishing.
    ///
    /// Messages are sent in order, one at a time, while connected.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.shared
            .engines
            .lock()
            .publication
            .publish(topic, payload.into(), qos, retain)
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) {
        self.shared.engines.lock().subscription.subscribe(topic, qos);
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.shared.engines.lock().subscription.unsubscribe(topic);
    }

    /// Whether the broker has granted a subscription to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.engines.lock().subscription.is_subscribed(topic)
    }

    /// Number of publishes not yet fully acknowledged.
    pub fn pending_publishes(&self) -> usize {
        self.shared.engines.lock().publication.len()
    }

    /// Whether a broker session is established.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn control(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| ClientError::InvalidState("Client task has stopped".to_string()))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Client task panicked");
            }
        }
    }
}

/// What the engines see of the task while they run.
struct Link<'a> {
    socket: Option<&'a SocketHandle<MqttPacket>>,
    events: &'a Sender<ClientEvent>,
    forced: bool,
}

impl ClientContext for Link<'_> {
    fn send_packet(&mut self, packet: MqttPacket) -> bool {
        if let Err(e) = packet.validate_packet() {
            error!("Refusing to send invalid packet: {}", e);
            return false;
        }
        packet.dump("Outgoing");
        match self.socket {
            Some(socket) => socket.send(packet),
            None => false,
        }
    }

    fn deliver(&mut self, publish: &Publish) {
        emit(self.events, ClientEvent::Message(Message::from(publish)));
    }

    fn force_disconnect(&mut self) {
        self.forced = true;
    }
}

fn emit(events: &Sender<ClientEvent>, event: ClientEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => warn!("Event queue full, dropping {:?}", event),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

struct Task {
    config: ClientConfig,
    shared: Arc<Shared>,
    dispatcher: DispatcherHandle,
    control: Receiver<Control>,
    network: Option<Receiver<NetworkStatus>>,
    events: Sender<ClientEvent>,
    socket: Option<SocketHandle<MqttPacket>>,
    socket_events: Option<Receiver<SocketEvent<MqttPacket>>>,
    /// Broker address as given by the application, resolved on every connect.
    address: Option<String>,
    state: ClientState,
    auto_reconnect: bool,
    /// Keep-alive period and when the next PINGREQ is due.
    ping: Option<(Duration, Instant)>,
    connect_started: Instant,
    disconnect_reason: &'static str,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    running: bool,
}

impl Task {
    fn run(mut self) {
        debug!("Client task started");
        let control = self.control.clone();
        let ticker = tick(self.config.tick);

        while self.running {
            let socket_events = self.socket_events.clone().unwrap_or_else(never);
            let network = self.network.clone().unwrap_or_else(never);

            select! {
                recv(control) -> msg => match msg {
                    Ok(msg) => {
                        self.drain_socket_events();
                        self.handle_control(msg);
                    }
                    // Every handle is gone
                    Err(_) => self.shutdown(),
                },
                recv(socket_events) -> msg => match msg {
                    Ok(event) => self.handle_socket_event(event),
                    Err(_) => self.socket_events = None,
                },
                recv(network) -> msg => match msg {
                    Ok(status) => self.handle_network(status),
                    Err(_) => self.network = None,
                },
                recv(ticker) -> _ => self.handle_tick(Instant::now()),
            }
        }
        debug!("Client task stopped");
    }

    /// Handle whatever the socket already reported, so that control
    /// requests see an up to date state.
    fn drain_socket_events(&mut self) {
        while let Some(event) = self.socket_events.as_ref().and_then(|rx| rx.try_recv().ok()) {
            self.handle_socket_event(event);
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Connect {
                address,
                auto_reconnect,
            } => self.connect(address, auto_reconnect),
            Control::Disconnect => {
                self.auto_reconnect = false;
                self.reconnect_at = None;
                self.disconnect_reason = DISCONNECT_REQUESTED;
                match self.state {
                    ClientState::ConnectToBroker { .. } | ClientState::Run { .. } => {
                        self.enter(ClientState::Disconnect {
                            since: Instant::now(),
                        });
                    }
                    ClientState::Disconnected => {
                        self.close_socket();
                        self.state = ClientState::Idle;
                    }
                    ClientState::Idle | ClientState::Disconnect { .. } => {}
                }
            }
            Control::Shutdown => self.shutdown(),
        }
    }

    fn connect(&mut self, address: String, auto_reconnect: bool) {
        if !matches!(self.state, ClientState::Idle | ClientState::Disconnected) {
            warn!("Already connected, ignoring connect to {}", address);
            return;
        }

        self.auto_reconnect = auto_reconnect;
        self.reconnect_at = None;
        self.close_socket();

        let created = self.dispatcher.create_socket(
            MqttProtocol::new(self.config.max_packet_size),
            self.config.socket_options(),
            self.config.tls.clone(),
        );
        match created {
            Ok((socket, events)) => {
                self.socket = Some(socket);
                self.socket_events = Some(events);
                self.address = Some(address);
                self.start_socket();
            }
            Err(e) => {
                error!("Can't create socket for {}: {}", address, e);
                self.connection_lost(e.to_string());
            }
        }
    }

    fn start_socket(&mut self) {
        let (Some(socket), Some(address)) = (self.socket.as_ref(), self.address.as_ref()) else {
            return;
        };
        info!("Connecting to {}", address);
        if let Err(e) = socket.start(address.as_str()) {
            error!("Can't connect to {}: {}", address, e);
            self.connection_lost(e.to_string());
        }
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        self.reconnect_attempts += 1;
        emit(
            &self.events,
            ClientEvent::Reconnecting {
                attempt: self.reconnect_attempts,
                delay: self.config.reconnect_delay,
            },
        );

        if self.socket.is_none() {
            warn!("Nothing to reconnect to");
            self.state = ClientState::Idle;
            return;
        }
        self.start_socket();
    }

    fn shutdown(&mut self) {
        self.close_socket();
        self.shared.connected.store(false, Ordering::Release);
        self.running = false;
    }

    fn close_socket(&mut self) {
        self.socket_events = None;
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.stop() {
                debug!("Stopping socket: {}", e);
            }
        }
    }

    fn handle_network(&mut self, status: NetworkStatus) {
        debug!("Network {:?}", status);
        // Only while waiting; an attempt in progress is left alone
        if status == NetworkStatus::Up && self.reconnect_at.is_some() {
            self.reconnect();
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent<MqttPacket>) {
        match event {
            SocketEvent::DataAvailable(packet) => self.handle_packet(packet),
            SocketEvent::TransmitBufferEmpty => {
                if matches!(self.state, ClientState::Disconnect { .. })
                    && self.socket.as_ref().is_some_and(|s| s.pending() == 0)
                {
                    self.finish_disconnect();
                }
            }
            SocketEvent::ConnectionStatus(ConnectionStatus::Connected(peer)) => match self.state {
                ClientState::Idle | ClientState::Disconnected => {
                    info!("Connected to {}", peer);
                    let clean_session = self.config.clean_session;
                    self.enter(ClientState::ConnectToBroker { clean_session });
                }
                state => warn!("Unexpected socket connect in state {}", state.name()),
            },
            SocketEvent::ConnectionStatus(ConnectionStatus::Disconnected { reason }) => {
                match self.state {
                    ClientState::ConnectToBroker { .. }
                    | ClientState::Run { .. }
                    | ClientState::Disconnect { .. } => self.connection_lost(reason),
                    ClientState::Disconnected => {
                        debug!("Reconnect failed: {}", reason);
                        self.arm_reconnect();
                    }
                    ClientState::Idle => debug!("Socket closed: {}", reason),
                }
            }
        }
    }

    fn handle_packet(&mut self, frame: MqttPacket) {
        if frame.is_too_big() {
            warn!("Dropping packet exceeding {} bytes", self.config.max_packet_size);
            return;
        }
        frame.dump("Incoming");
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet: {}", e);
                return;
            }
        };

        match self.state {
            ClientState::ConnectToBroker { clean_session } => match packet {
                Packet::Connack(connack) => self.handle_connack(connack, clean_session),
                other => warn!(
                    "Expected CONNACK, got {}",
                    other.packet_type().as_str()
                ),
            },
            ClientState::Run { .. } => self.handle_session_packet(packet),
            state => debug!(
                "Ignoring {} in state {}",
                packet.packet_type().as_str(),
                state.name()
            ),
        }
    }

    fn handle_connack(&mut self, connack: Connack, clean_session: bool) {
        if connack.code != ConnackCode::Accepted {
            warn!("Broker refused connection: {:?}", connack.code);
            emit(&self.events, ClientEvent::Refused(connack.code));
            self.close_socket();
            self.state = ClientState::Idle;
            self.ping = None;
            return;
        }

        info!(
            "Broker accepted connection (session present: {})",
            connack.session_present
        );
        self.reconnect_attempts = 0;
        self.shared.connected.store(true, Ordering::Release);
        self.enter(ClientState::Run {
            clean_session,
            reconnect_handled: false,
        });
        emit(
            &self.events,
            ClientEvent::Connected {
                session_present: connack.session_present,
            },
        );
    }

    fn handle_session_packet(&mut self, packet: Packet) {
        let packet_type = packet.packet_type();
        self.with_engines(|engines, link| match packet {
            Packet::Publish(publish) => engines.subscription.receive_publish(&publish, link),
            Packet::Puback { packet_id } => engines.publication.receive_puback(packet_id),
            Packet::Pubrec { packet_id } => engines.publication.receive_pubrec(packet_id, link),
            Packet::Pubrel { packet_id } => engines.subscription.receive_pubrel(packet_id, link),
            Packet::Pubcomp { packet_id } => engines.publication.receive_pubcomp(packet_id),
            Packet::Suback(suback) => engines.subscription.receive_suback(&suback),
            Packet::Unsuback { packet_id } => engines.subscription.receive_unsuback(packet_id),
            Packet::Pingresp => trace!("PINGRESP"),
            Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::Pingreq
            | Packet::Disconnect => {
                warn!("Unexpected {} from broker", packet_type.as_str())
            }
        });
    }

    fn handle_tick(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect();
        }

        match self.state {
            ClientState::Disconnect { since } => {
                if now.duration_since(since) >= self.config.disconnect_linger {
                    self.finish_disconnect();
                }
                return;
            }
            ClientState::ConnectToBroker { .. } => {
                // Nothing else may go out before CONNACK
                if now.duration_since(self.connect_started) > self.config.ack_timeout {
                    warn!("No CONNACK from broker");
                    self.close_socket_keep_handle();
                    self.connection_lost(NO_CONNACK.to_string());
                }
                return;
            }
            ClientState::Run {
                clean_session,
                reconnect_handled,
            } => {
                self.with_engines(|engines, link| {
                    if !reconnect_handled {
                        engines
                            .publication
                            .resend_outstanding_control_packet(link, clean_session);
                    }
                    engines.publication.publish_next(link);
                    engines.subscription.subscribe_next(link);
                });
                if let ClientState::Run {
                    reconnect_handled, ..
                } = &mut self.state
                {
                    *reconnect_handled = true;
                }
            }
            ClientState::Idle | ClientState::Disconnected => return,
        }

        if let Some((period, due)) = self.ping {
            if now >= due {
                self.with_engines(|_, link| send(link, &Packet::Pingreq));
                self.ping = Some((period, now + period));
            }
        }
    }

    /// Run the engines with a link to the socket. A forced disconnect
    /// requested by an engine takes effect afterwards.
    fn with_engines<R>(&mut self, f: impl FnOnce(&mut Engines, &mut Link<'_>) -> R) -> R {
        let mut link = Link {
            socket: self.socket.as_ref(),
            events: &self.events,
            forced: false,
        };
        let result = {
            let mut engines = self.shared.engines.lock();
            f(&mut engines, &mut link)
        };
        let forced = link.forced;

        if forced && !matches!(self.state, ClientState::Disconnect { .. }) {
            warn!("Forcing disconnect");
            self.disconnect_reason = DISCONNECT_FORCED;
            self.enter(ClientState::Disconnect {
                since: Instant::now(),
            });
        }
        result
    }

    fn enter(&mut self, state: ClientState) {
        debug!("{} -> {}", self.state.name(), state.name());
        self.state = state;

        match state {
            ClientState::ConnectToBroker { clean_session } => {
                self.connect_started = Instant::now();
                let connect = Connect {
                    client_id: self.config.client_id.clone(),
                    keep_alive: self.config.keep_alive_secs(),
                    clean_session,
                    username: self.config.username.clone(),
                    password: self.config.password.clone(),
                };
                self.with_engines(|_, link| send(link, &Packet::Connect(connect)));
            }
            ClientState::Run { .. } => {
                let period = self.config.keep_alive / 2;
                self.ping = (!period.is_zero()).then(|| (period, Instant::now() + period));
            }
            ClientState::Disconnect { .. } => {
                self.ping = None;
                self.with_engines(|_, link| send(link, &Packet::Disconnect));
            }
            ClientState::Idle | ClientState::Disconnected => {}
        }
    }

    /// Close the socket after DISCONNECT went out or the linger expired.
    fn finish_disconnect(&mut self) {
        self.close_socket_keep_handle();
        self.connection_lost(self.disconnect_reason.to_string());
    }

    /// Stop the socket but keep it around for reconnecting.
    fn close_socket_keep_handle(&mut self) {
        if let Some(socket) = self.socket.as_ref() {
            if let Err(e) = socket.stop() {
                debug!("Stopping socket: {}", e);
            }
        }
    }

    /// The broker session is gone. Prepare the engines for the next one and
    /// reconnect if enabled.
    fn connection_lost(&mut self, reason: String) {
        {
            let mut engines = self.shared.engines.lock();
            engines.publication.handle_disconnect();
            engines.subscription.handle_disconnect();
        }
        self.shared.connected.store(false, Ordering::Release);
        self.ping = None;
        info!("Disconnected: {}", reason);
        emit(&self.events, ClientEvent::Disconnected { reason });

        if self.auto_reconnect && self.socket.is_some() {
            debug!("{} -> Disconnected", self.state.name());
            self.state = ClientState::Disconnected;
            self.arm_reconnect();
        } else {
            debug!("{} -> Idle", self.state.name());
            self.state = ClientState::Idle;
        }
    }

    fn arm_reconnect(&mut self) {
        if self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};

    use tidemq_core::varint;
    use tidemq_core::Suback;
    use tidemq_net::{Dispatcher, DispatcherConfig};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn_dispatcher() -> DispatcherHandle {
        let _ = env_logger::builder().is_test(true).try_init();
        let (handle, _thread) = Dispatcher::spawn(DispatcherConfig::default()).unwrap();
        handle
    }

    fn config() -> ClientConfig {
        ClientConfig::new("tester")
            .tick(Duration::from_millis(10))
            .reconnect_delay(Duration::from_millis(100))
    }

    fn broker() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn accept(listener: &TcpListener) -> TcpStream {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn read_packet(stream: &mut TcpStream) -> Packet {
        let mut data = vec![0u8; 1];
        stream.read_exact(&mut data).unwrap();
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
            data.push(byte[0]);
            if byte[0] & varint::CONTINUATION_BIT == 0 {
                break;
            }
        }
        let (remaining, _) = varint::decode(&data[1..]).unwrap().unwrap();
        let start = data.len();
        data.resize(start + remaining, 0);
        stream.read_exact(&mut data[start..]).unwrap();
        Packet::decode(&MqttPacket::from(data)).unwrap()
    }

    /// Skip pings, which may show up at any time.
    fn read_non_ping(stream: &mut TcpStream) -> Packet {
        loop {
            match read_packet(stream) {
                Packet::Pingreq => continue,
                packet => return packet,
            }
        }
    }

    fn write_packet(stream: &mut TcpStream, packet: Packet) {
        stream
            .write_all(packet.encode().unwrap().as_slice())
            .unwrap();
    }

    fn handshake(stream: &mut TcpStream, session_present: bool) -> Connect {
        let Packet::Connect(connect) = read_packet(stream) else {
            panic!("expected CONNECT");
        };
        write_packet(
            stream,
            Packet::Connack(Connack {
                session_present,
                code: ConnackCode::Accepted,
            }),
        );
        connect
    }

    fn next_event(events: &Receiver<ClientEvent>) -> ClientEvent {
        events.recv_timeout(TIMEOUT).expect("no client event")
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_empty_client_id_needs_clean_session() {
        let dispatcher = spawn_dispatcher();
        let config = ClientConfig::default().clean_session(false);
        assert!(matches!(
            Client::new(config, dispatcher),
            Err(ClientError::InvalidState(_))
        ));
    }

    #[test]
    fn test_session_roundtrip() {
        let (listener, addr) = broker();
        let (client, events) = Client::new(config(), spawn_dispatcher()).unwrap();
        client.connect_to(addr.to_string(), false).unwrap();

        let mut stream = accept(&listener);
        let connect = handshake(&mut stream, false);
        assert_eq!(connect.client_id, "tester");
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 60);
        assert_eq!(
            next_event(&events),
            ClientEvent::Connected {
                session_present: false
            }
        );
        assert!(client.is_connected());

        // Subscribe
        client.subscribe("sensors/#", QoS::AtLeastOnce);
        let Packet::Subscribe(subscribe) = read_non_ping(&mut stream) else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(subscribe.topics, vec![("sensors/#".to_string(), QoS::AtLeastOnce)]);
        write_packet(
            &mut stream,
            Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                return_codes: vec![1],
            }),
        );
        wait_until(|| client.is_subscribed("sensors/#"));

        // Outbound QoS 1
        client
            .publish("sensors/temp", "21.5", QoS::AtLeastOnce, false)
            .unwrap();
        let Packet::Publish(publish) = read_non_ping(&mut stream) else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.topic_str(), Some("sensors/temp"));
        assert_eq!(publish.payload, Bytes::from_static(b"21.5"));
        assert!(!publish.dup);
        let packet_id = publish.packet_id.unwrap();
        write_packet(&mut stream, Packet::Puback { packet_id });
        wait_until(|| client.pending_publishes() == 0);

        // Inbound QoS 1 is delivered and acknowledged
        write_packet(
            &mut stream,
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: Bytes::from_static(b"sensors/hum"),
                packet_id: Some(77),
                payload: Bytes::from_static(b"40"),
            }),
        );
        assert_eq!(
            next_event(&events),
            ClientEvent::Message(Message {
                topic: "sensors/hum".to_string(),
                payload: Bytes::from_static(b"40"),
                qos: QoS::AtLeastOnce,
                retain: false,
            })
        );
        assert_eq!(read_non_ping(&mut stream), Packet::Puback { packet_id: 77 });

        client.disconnect().unwrap();
        assert_eq!(read_non_ping(&mut stream), Packet::Disconnect);
        assert_eq!(
            next_event(&events),
            ClientEvent::Disconnected {
                reason: DISCONNECT_REQUESTED.to_string()
            }
        );
        assert!(!client.is_connected());
    }

    #[test]
    fn test_refused_connection() {
        let (listener, addr) = broker();
        let (client, events) = Client::new(config(), spawn_dispatcher()).unwrap();
        client.connect_to(addr.to_string(), true).unwrap();

        let mut stream = accept(&listener);
        assert!(matches!(read_packet(&mut stream), Packet::Connect(_)));
        write_packet(
            &mut stream,
            Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::NotAuthorized,
            }),
        );
        assert_eq!(
            next_event(&events),
            ClientEvent::Refused(ConnackCode::NotAuthorized)
        );
        assert!(!client.is_connected());
    }

    #[test]
    fn test_reconnect_resends_unacknowledged_publish() {
        let (listener, addr) = broker();
        let config = config().client_id("persistent").clean_session(false);
        let (client, events) = Client::new(config, spawn_dispatcher()).unwrap();
        client.connect_to(addr.to_string(), true).unwrap();

        let mut stream = accept(&listener);
        handshake(&mut stream, false);
        assert!(matches!(next_event(&events), ClientEvent::Connected { .. }));

        client
            .publish("a/b", "payload", QoS::AtLeastOnce, false)
            .unwrap();
        let Packet::Publish(first) = read_non_ping(&mut stream) else {
            panic!("expected PUBLISH");
        };
        assert!(!first.dup);
        drop(stream);

        assert!(matches!(next_event(&events), ClientEvent::Disconnected { .. }));
        assert!(matches!(
            next_event(&events),
            ClientEvent::Reconnecting { attempt: 1, .. }
        ));

        let mut stream = accept(&listener);
        let connect = handshake(&mut stream, true);
        assert!(!connect.clean_session);
        assert_eq!(
            next_event(&events),
            ClientEvent::Connected {
                session_present: true
            }
        );

        let Packet::Publish(again) = read_non_ping(&mut stream) else {
            panic!("expected PUBLISH");
        };
        assert!(again.dup);
        assert_eq!(again.packet_id, first.packet_id);
        assert_eq!(again.payload, first.payload);

        write_packet(
            &mut stream,
            Packet::Puback {
                packet_id: again.packet_id.unwrap(),
            },
        );
        wait_until(|| client.pending_publishes() == 0);
    }

    #[test]
    fn test_keep_alive_pings_every_half_period() {
        let (listener, addr) = broker();
        let config = config().keep_alive(Duration::from_secs(2));
        let (client, events) = Client::new(config, spawn_dispatcher()).unwrap();
        client.connect_to(addr.to_string(), false).unwrap();

        let mut stream = accept(&listener);
        let connect = handshake(&mut stream, false);
        assert_eq!(connect.keep_alive, 2);
        assert!(matches!(next_event(&events), ClientEvent::Connected { .. }));

        for _ in 0..2 {
            let started = Instant::now();
            assert_eq!(read_packet(&mut stream), Packet::Pingreq);
            assert!(started.elapsed() < Duration::from_millis(1500));
            write_packet(&mut stream, Packet::Pingresp);
        }
    }

    #[test]
    fn test_connack_timeout_reconnects() {
        let (listener, addr) = broker();
        let config = config()
            .keep_alive(Duration::from_secs(2))
            .ack_timeout(Duration::from_millis(1500));
        let (client, events) = Client::new(config, spawn_dispatcher()).unwrap();
        client.connect_to(addr.to_string(), true).unwrap();

        let mut stream = accept(&listener);
        assert!(matches!(read_packet(&mut stream), Packet::Connect(_)));

        // No PINGREQ or anything else before the socket is closed
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);

        assert_eq!(
            next_event(&events),
            ClientEvent::Disconnected {
                reason: NO_CONNACK.to_string()
            }
        );
        assert!(matches!(
            next_event(&events),
            ClientEvent::Reconnecting { attempt: 1, .. }
        ));
        let mut stream = accept(&listener);
        assert!(matches!(read_packet(&mut stream), Packet::Connect(_)));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_missing_puback_forces_disconnect() {
        let (listener, addr) = broker();
        let config = config().ack_timeout(Duration::from_millis(300));
        let (client, events) = Client::new(config, spawn_dispatcher()).unwrap();
        client.connect_to(addr.to_string(), false).unwrap();

        let mut stream = accept(&listener);
        handshake(&mut stream, false);
        assert!(matches!(next_event(&events), ClientEvent::Connected { .. }));

        client.publish("a/b", "1", QoS::AtLeastOnce, false).unwrap();
        assert!(matches!(read_non_ping(&mut stream), Packet::Publish(_)));

        // Withhold PUBACK
        assert_eq!(read_non_ping(&mut stream), Packet::Disconnect);
        assert_eq!(
            next_event(&events),
            ClientEvent::Disconnected {
                reason: DISCONNECT_FORCED.to_string()
            }
        );
        assert!(!client.is_connected());
        assert_eq!(client.pending_publishes(), 1);
    }

    #[test]
    fn test_publish_queue_full() {
        let (client, _events) =
            Client::new(config().max_outgoing(1), spawn_dispatcher()).unwrap();
        client.publish("t", "1", QoS::AtMostOnce, false).unwrap();
        assert!(matches!(
            client.publish("t", "2", QoS::AtMostOnce, false),
            Err(ClientError::QueueFull)
        ));
    }
}
