//! Non-blocking, framed TCP socket.
//!
//! A [`Socket`] lives inside the dispatcher and is only ever touched by the
//! dispatcher thread. The owning task talks to it through a [`SocketHandle`]
//! (outbound queue plus start/stop requests) and receives [`SocketEvent`]s
//! on a bounded channel.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use mio::event::Source;
use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;

use tidemq_core::framing::{Disassembly, Protocol};

use crate::dispatcher::{Context, DispatcherHandle, Op};
use crate::error::{NetError, Result};
use crate::events::{ConnectionStatus, SocketEvent};
use crate::options::SocketOptions;
use crate::server::PoolSlot;
use crate::tls::{HandshakeStatus, TlsSetup, TlsStream};
use crate::transmit::TransmitBuffer;
use crate::transport::Transport;

/// Identifier of a socket within its dispatcher. Doubles as the mio token.
pub type SocketId = usize;

/// Upper bound on reads per readiness event so one busy peer can't starve the rest.
const MAX_READS_PER_EVENT: usize = 256;

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

/// Dispatcher side view of anything it polls.
pub(crate) trait ActiveSocket: Send {
    fn id(&self) -> SocketId;

    /// Begin connecting (or listening) at `address`. False if already active.
    fn start(&mut self, address: SocketAddr) -> bool;

    /// Close the socket. Idempotent.
    fn stop(&mut self, reason: &str);

    fn is_active(&self) -> bool;

    fn is_server(&self) -> bool {
        false
    }

    /// Last address given to [`ActiveSocket::start`].
    fn address(&self) -> Option<SocketAddr>;

    /// Readiness the socket wants to be polled for, if any.
    fn interest(&self) -> Option<Interest>;

    fn source(&mut self) -> Option<&mut dyn Source>;

    /// Interest currently registered with the poll.
    fn registration(&mut self) -> &mut Option<Interest>;

    fn readable(&mut self, ctx: &mut Context<'_>);

    fn writable(&mut self);

    /// Which timeout expired, with its limit.
    fn expired(&self, now: Instant) -> Option<(&'static str, Duration)>;

    /// Work left over that doesn't depend on a readiness event.
    fn has_pending_work(&self) -> bool;

    fn drive(&mut self, ctx: &mut Context<'_>);
}

/// A framed TCP (optionally TLS) connection.
pub(crate) struct Socket<P: Protocol> {
    id: SocketId,
    state: SocketState,
    address: Option<SocketAddr>,
    transport: Option<Transport>,
    registered: Option<Interest>,
    tls: Option<TlsSetup>,
    options: SocketOptions,
    protocol: P,
    rx_packet: P::Packet,
    tx: Arc<Mutex<TransmitBuffer<P::Packet>>>,
    current: Option<P::Packet>,
    bytes_sent: usize,
    events: Sender<SocketEvent<P::Packet>>,
    outbox: VecDeque<SocketEvent<P::Packet>>,
    send_started: Option<Instant>,
    last_activity: Option<Instant>,
    read_pending: bool,
    _slot: Option<PoolSlot>,
}

impl<P: Protocol> Socket<P> {
    pub(crate) fn new(
        id: SocketId,
        protocol: P,
        options: SocketOptions,
        tls: Option<TlsSetup>,
        tx: Arc<Mutex<TransmitBuffer<P::Packet>>>,
        events: Sender<SocketEvent<P::Packet>>,
    ) -> Self {
        Self {
            id,
            state: SocketState::Idle,
            address: None,
            transport: None,
            registered: None,
            tls,
            options,
            protocol,
            rx_packet: P::Packet::default(),
            tx,
            current: None,
            bytes_sent: 0,
            events,
            outbox: VecDeque::new(),
            send_started: None,
            last_activity: None,
            read_pending: false,
            _slot: None,
        }
    }

    /// Wrap a stream returned by `accept`. The socket starts out connected,
    /// or handshaking when `tls` is given.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn accepted(
        id: SocketId,
        stream: TcpStream,
        peer: SocketAddr,
        protocol: P,
        options: SocketOptions,
        tls: Option<TlsSetup>,
        tx: Arc<Mutex<TransmitBuffer<P::Packet>>>,
        events: Sender<SocketEvent<P::Packet>>,
        slot: PoolSlot,
    ) -> Self {
        let mut socket = Self::new(id, protocol, options, None, tx, events);
        socket.address = Some(peer);
        socket._slot = Some(slot);

        if socket.options.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("[{} {}] Failed to set no delay socket option: {}", id, peer, e);
            }
        }

        match tls {
            None => {
                socket.transport = Some(Transport::plain(stream));
                socket.on_connected();
            }
            Some(setup) => match setup.connection() {
                Ok(conn) => {
                    socket.transport = Some(Transport::tls(TlsStream::new(conn, stream)));
                    socket.state = SocketState::Handshaking;
                    socket.send_started = Some(Instant::now());
                    // The client hello may already be waiting
                    socket.read_pending = true;
                }
                Err(e) => {
                    error!("[{} {}] Failed to create TLS connection: {}", id, peer, e);
                    socket.state = SocketState::Closed;
                }
            },
        }
        socket
    }

    fn peer(&self) -> String {
        self.address
            .map_or_else(|| "-".to_string(), |addr| addr.to_string())
    }

    fn clear_buffers(&mut self) {
        self.tx.lock().clear();
        self.current = None;
        self.bytes_sent = 0;
        self.protocol.reset();
        self.rx_packet = P::Packet::default();
    }

    /// Hand queued events to the owner. False while the channel is full.
    fn flush_outbox(&mut self) -> bool {
        while let Some(event) = self.outbox.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.outbox.push_front(event);
                    return false;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.outbox.clear();
                    return true;
                }
            }
        }
        true
    }

    fn on_connected(&mut self) {
        self.state = SocketState::Connected;
        self.send_started = None;
        self.last_activity = Some(Instant::now());
        self.read_pending = true;
        info!("[{} {}] Connected", self.id, self.peer());

        if let Some(addr) = self.address {
            self.outbox
                .push_back(SocketEvent::ConnectionStatus(ConnectionStatus::Connected(addr)));
        }
        self.flush_outbox();
        self.send_pending();
    }

    fn finish_connect(&mut self) {
        let (result, is_tls) = match &self.transport {
            Some(transport) => (connect_result(transport.tcp_stream()), transport.is_tls()),
            None => return,
        };

        match result {
            Ok(true) => {}
            // Spurious wakeup, still connecting
            Ok(false) => return,
            Err(e) => {
                self.stop(&format!("Error during connect: {}", e));
                return;
            }
        }

        if self.options.no_delay {
            if let Some(Err(e)) = self.transport.as_ref().map(|t| t.tcp_stream().set_nodelay(true)) {
                warn!("[{} {}] Failed to set no delay socket option: {}", self.id, self.peer(), e);
            }
        }

        if is_tls {
            self.state = SocketState::Handshaking;
            self.step_handshake();
        } else {
            self.on_connected();
        }
    }

    fn step_handshake(&mut self) {
        let status = match self.transport.as_mut() {
            Some(transport) => transport.handshake(),
            None => return,
        };

        match status {
            Ok(HandshakeStatus::Complete) => {
                debug!("[{} {}] TLS handshake complete", self.id, self.peer());
                self.on_connected();
            }
            Ok(HandshakeStatus::WantRead) | Ok(HandshakeStatus::WantWrite) => {}
            Err(e) => self.stop(&format!("TLS handshake failed: {}", e)),
        }
    }

    fn read_data(&mut self) {
        self.read_pending = false;

        for _ in 0..MAX_READS_PER_EVENT {
            if !self.flush_outbox() {
                // Owner is behind; try again once it has drained the channel
                self.read_pending = true;
                return;
            }

            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            let wanted = self.protocol.wanted_amount(&mut self.rx_packet);
            let buf = self.protocol.write_pos(&mut self.rx_packet);
            let len = wanted.min(buf.len());
            if len == 0 {
                warn!("[{} {}] Protocol wants no data, resetting", self.id, self.peer());
                self.protocol.reset();
                self.rx_packet = P::Packet::default();
                continue;
            }

            match transport.read(&mut buf[..len]) {
                Ok(0) => {
                    self.stop("Underlying socket closed");
                    return;
                }
                Ok(n) => {
                    self.last_activity = Some(Instant::now());
                    self.bytes_received(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stop(&format!("Error during receive: {}", e));
                    return;
                }
            }
        }

        self.read_pending = true;
    }

    fn bytes_received(&mut self, length: usize) {
        self.protocol.on_bytes_received(&mut self.rx_packet, length);

        if self.protocol.is_error() {
            warn!("[{} {}] Assembly error, dropping packet", self.id, self.peer());
            self.protocol.reset();
            self.rx_packet = P::Packet::default();
        } else if self.protocol.is_complete(&self.rx_packet) {
            let packet = mem::take(&mut self.rx_packet);
            self.protocol.packet_consumed();
            self.outbox.push_back(SocketEvent::DataAvailable(packet));
        }
    }

    /// Write queued packets, one at a time, until done or the stream blocks.
    fn send_pending(&mut self) {
        if self.state != SocketState::Connected {
            return;
        }

        loop {
            if self.current.is_none() {
                self.current = self.tx.lock().take();
                self.bytes_sent = 0;
                if self.current.is_none() {
                    break;
                }
            }

            let (Some(transport), Some(packet)) = (self.transport.as_mut(), self.current.as_ref())
            else {
                return;
            };
            let end = packet.send_length().min(packet.data().len());

            let result = if self.bytes_sent >= end {
                Ok(0)
            } else {
                transport.write(&packet.data()[self.bytes_sent..end])
            };

            match result {
                Ok(0) if self.bytes_sent < end => {
                    self.stop("Failure during send");
                    return;
                }
                Ok(n) => {
                    self.last_activity = Some(Instant::now());
                    self.bytes_sent += n;
                    if self.bytes_sent >= end {
                        trace!("[{} {}] Sent {} bytes", self.id, self.peer(), end);
                        self.current = None;
                        self.bytes_sent = 0;
                        if self.tx.lock().is_empty() {
                            self.outbox.push_back(SocketEvent::TransmitBufferEmpty);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.send_started.get_or_insert_with(Instant::now);
                    self.flush_outbox();
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stop(&format!("Failure during send: {}", e));
                    return;
                }
            }
        }

        // TLS may still hold records for data it accepted above
        let flushed = match self.transport.as_mut() {
            Some(transport) => transport.flush(),
            None => Ok(()),
        };
        match flushed {
            Ok(()) => self.send_started = None,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_started.get_or_insert_with(Instant::now);
            }
            Err(e) => {
                self.stop(&format!("Failure during send: {}", e));
                return;
            }
        }
        self.flush_outbox();
    }
}

fn connect_result(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

impl<P: Protocol> ActiveSocket for Socket<P> {
    fn id(&self) -> SocketId {
        self.id
    }

    fn start(&mut self, address: SocketAddr) -> bool {
        if self.is_active() {
            return false;
        }

        self.clear_buffers();
        self.address = Some(address);
        info!("[{} {}] Connecting", self.id, address);

        let stream = match TcpStream::connect(address) {
            Ok(stream) => stream,
            Err(e) => {
                self.state = SocketState::Closed;
                let reason = format!("Error during connect: {}", e);
                error!("[{} {}] {}", self.id, address, reason);
                self.outbox
                    .push_back(SocketEvent::ConnectionStatus(ConnectionStatus::Disconnected {
                        reason,
                    }));
                self.flush_outbox();
                return false;
            }
        };

        let transport = match &self.tls {
            None => Transport::plain(stream),
            Some(setup) => match setup.connection() {
                Ok(conn) => Transport::tls(TlsStream::new(conn, stream)),
                Err(e) => {
                    self.state = SocketState::Closed;
                    let reason = format!("Failed to create TLS connection: {}", e);
                    error!("[{} {}] {}", self.id, address, reason);
                    self.outbox
                        .push_back(SocketEvent::ConnectionStatus(ConnectionStatus::Disconnected {
                            reason,
                        }));
                    self.flush_outbox();
                    return false;
                }
            },
        };

        self.transport = Some(transport);
        self.registered = None;
        self.state = SocketState::Connecting;
        // Connect and handshake count against the send timeout
        self.send_started = Some(Instant::now());
        true
    }

    fn stop(&mut self, reason: &str) {
        let was_active = self.is_active();

        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        self.registered = None;
        self.clear_buffers();
        self.send_started = None;
        self.last_activity = None;
        self.read_pending = false;

        if was_active {
            info!("[{} {}] Socket stopping: {}", self.id, self.peer(), reason);
            self.state = SocketState::Closed;
            self.outbox
                .push_back(SocketEvent::ConnectionStatus(ConnectionStatus::Disconnected {
                    reason: reason.to_string(),
                }));
            self.flush_outbox();
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            SocketState::Connecting | SocketState::Handshaking | SocketState::Connected
        )
    }

    fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn interest(&self) -> Option<Interest> {
        self.transport.as_ref()?;
        match self.state {
            SocketState::Connecting => Some(Interest::WRITABLE),
            SocketState::Handshaking | SocketState::Connected => {
                Some(Interest::READABLE | Interest::WRITABLE)
            }
            SocketState::Idle | SocketState::Closed => None,
        }
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.transport
            .as_mut()
            .map(|t| t.tcp_stream_mut() as &mut dyn Source)
    }

    fn registration(&mut self) -> &mut Option<Interest> {
        &mut self.registered
    }

    fn readable(&mut self, _ctx: &mut Context<'_>) {
        match self.state {
            SocketState::Connecting => self.finish_connect(),
            SocketState::Handshaking => self.step_handshake(),
            SocketState::Connected => self.read_data(),
            SocketState::Idle | SocketState::Closed => {}
        }
    }

    fn writable(&mut self) {
        match self.state {
            SocketState::Connecting => self.finish_connect(),
            SocketState::Handshaking => self.step_handshake(),
            SocketState::Connected => {
                self.send_started = None;
                self.send_pending();
            }
            SocketState::Idle | SocketState::Closed => {}
        }
    }

    fn expired(&self, now: Instant) -> Option<(&'static str, Duration)> {
        let send_timeout = self.options.send_timeout;
        if let Some(started) = self.send_started {
            if !send_timeout.is_zero() && now.saturating_duration_since(started) > send_timeout {
                return Some(("Send timeout", send_timeout));
            }
        }

        let receive_timeout = self.options.receive_timeout;
        if self.state == SocketState::Connected && !receive_timeout.is_zero() {
            if let Some(last) = self.last_activity {
                if now.saturating_duration_since(last) > receive_timeout {
                    return Some(("Receive timeout", receive_timeout));
                }
            }
        }
        None
    }

    fn has_pending_work(&self) -> bool {
        if !self.outbox.is_empty() || self.read_pending {
            return true;
        }
        self.state == SocketState::Connected
            && self.send_started.is_none()
            && (self.current.is_some() || !self.tx.lock().is_empty())
    }

    fn drive(&mut self, _ctx: &mut Context<'_>) {
        if !self.flush_outbox() {
            return;
        }
        match self.state {
            SocketState::Connected => {
                if self.read_pending {
                    self.read_data();
                }
                if self.send_started.is_none() {
                    self.send_pending();
                }
            }
            SocketState::Handshaking if self.read_pending => {
                self.read_pending = false;
                self.step_handshake();
            }
            _ => {}
        }
    }
}

/// Application side of a socket.
///
/// Dropping the handle removes the socket from the dispatcher.
pub struct SocketHandle<T> {
    id: SocketId,
    tx: Arc<Mutex<TransmitBuffer<T>>>,
    target: Mutex<Option<String>>,
    dispatcher: DispatcherHandle,
}

impl<T> SocketHandle<T> {
    pub(crate) fn new(
        id: SocketId,
        tx: Arc<Mutex<TransmitBuffer<T>>>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            id,
            tx,
            target: Mutex::new(None),
            dispatcher,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queue a packet for transmission.
    ///
    /// Returns false when the outbound queue is full.
    pub fn send(&self, packet: T) -> bool {
        let queued = self.tx.lock().put(packet);
        if queued {
            if let Err(e) = self.dispatcher.send_op(Op::Flush(self.id)) {
                debug!("Socket {}: {}", self.id, e);
            }
        }
        queued
    }

    /// Number of packets waiting in the outbound queue.
    pub fn pending(&self) -> usize {
        self.tx.lock().len()
    }

    /// Resolve `target` (`host:port`) and connect to it.
    pub fn start(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        let address = resolve(&target)?;
        *self.target.lock() = Some(target);
        self.dispatcher.send_op(Op::Start {
            id: self.id,
            address,
        })
    }

    /// Connect to an already resolved address.
    pub fn start_at(&self, address: SocketAddr) -> Result<()> {
        *self.target.lock() = None;
        self.dispatcher.send_op(Op::Start {
            id: self.id,
            address,
        })
    }

    pub fn stop(&self) -> Result<()> {
        self.dispatcher.send_op(Op::Stop(self.id))
    }

    /// Stop and start again, resolving the last target anew.
    pub fn restart(&self) -> Result<()> {
        let target = self.target.lock().clone();
        let address = match target {
            Some(target) => Some(resolve(&target)?),
            None => None,
        };
        self.dispatcher.send_op(Op::Restart {
            id: self.id,
            address,
        })
    }
}

impl<T> Drop for SocketHandle<T> {
    fn drop(&mut self) {
        let _ = self.dispatcher.send_op(Op::Remove(self.id));
    }
}

/// Resolve `host:port` to its first address.
pub fn resolve(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .map_err(|e| NetError::Resolve(format!("{}: {}", target, e)))?
        .next()
        .ok_or_else(|| NetError::Resolve(format!("{}: no addresses", target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crossbeam_channel::Receiver;
    use tidemq_core::{MqttPacket, MqttProtocol, Packet};

    use crate::testing::{expect_connected, expect_disconnected, next_event, spawn_dispatcher};

    fn echo_server() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    fn next_packet(events: &Receiver<SocketEvent<MqttPacket>>) -> MqttPacket {
        loop {
            match next_event(events) {
                SocketEvent::DataAvailable(packet) => return packet,
                SocketEvent::TransmitBufferEmpty => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_resolve_loopback() {
        let addr = resolve("127.0.0.1:1883").unwrap();
        assert_eq!(addr.port(), 1883);
        assert!(resolve("not an address").is_err());
    }

    #[test]
    fn test_echo_roundtrip() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let addr = echo_server();

        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), SocketOptions::default(), None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_connected(&events);

        let ping = Packet::Pingreq.encode().unwrap();
        assert!(socket.send(ping.clone()));
        assert_eq!(next_packet(&events), ping);

        let publish = Packet::Puback { packet_id: 42 }.encode().unwrap();
        assert!(socket.send(publish.clone()));
        assert_eq!(next_packet(&events), publish);

        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_transmit_buffer_empty_after_flush() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let addr = echo_server();

        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), SocketOptions::default(), None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_connected(&events);

        assert!(socket.send(Packet::Disconnect.encode().unwrap()));
        loop {
            match next_event(&events) {
                SocketEvent::TransmitBufferEmpty => break,
                SocketEvent::DataAvailable(_) => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_connect_refused_reports_disconnect() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), SocketOptions::default(), None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_disconnected(&events);
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_receive_timeout_stops_socket() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = thread::spawn(move || {
            let accepted = listener.accept();
            thread::sleep(Duration::from_secs(2));
            drop(accepted);
        });

        let options = SocketOptions::default().receive_timeout(Duration::from_millis(200));
        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), options, None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_connected(&events);

        let started = Instant::now();
        let reason = expect_disconnected(&events);
        assert!(reason.contains("Receive timeout"), "{}", reason);
        assert!(started.elapsed() < Duration::from_secs(2));

        dispatcher.shutdown().unwrap();
        silent.join().unwrap();
    }

    #[test]
    fn test_malformed_packet_is_dropped_and_stream_recovers() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // Remaining length with five continuation bytes
            stream.write_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
            stream.write_all(&[0xD0, 0x00]).unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), SocketOptions::default(), None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_connected(&events);

        // The bad length resets assembly and the stream picks up at the PINGRESP
        let packet = next_packet(&events);
        assert_eq!(Packet::decode(&packet).ok(), Some(Packet::Pingresp));

        drop(socket);
        server.join().unwrap();
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_slow_consumer_is_throttled_not_dropped() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for id in 1..=20u16 {
                let packet = Packet::Puback { packet_id: id }.encode().unwrap();
                stream.write_all(packet.as_slice()).unwrap();
            }
            thread::sleep(Duration::from_millis(1000));
        });

        let options = SocketOptions::default()
            .event_queue_size(1)
            .receive_timeout(Duration::ZERO);
        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), options, None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_connected(&events);

        for id in 1..=20u16 {
            thread::sleep(Duration::from_millis(5));
            let packet = next_packet(&events);
            assert_eq!(
                Packet::decode(&packet).unwrap(),
                Packet::Puback { packet_id: id }
            );
        }

        drop(socket);
        server.join().unwrap();
        dispatcher.shutdown().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_restart_reconnects() {
        let (dispatcher, _thread) = spawn_dispatcher();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let first = listener.accept().unwrap();
            let second = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
            drop((first, second));
        });

        let options = SocketOptions::default().receive_timeout(Duration::ZERO);
        let (socket, events) = dispatcher
            .create_socket(MqttProtocol::default(), options, None)
            .unwrap();
        socket.start_at(addr).unwrap();
        expect_connected(&events);

        socket.stop().unwrap();
        socket.stop().unwrap();
        expect_disconnected(&events);

        socket.restart().unwrap();
        expect_connected(&events);

        server.join().unwrap();
        dispatcher.shutdown().unwrap();
    }
}
