//! Single-threaded socket dispatcher.
//!
//! The dispatcher owns every socket and drives them from one mio poll loop:
//! - Control requests (add/start/stop/remove/flush) arrive on a channel and
//!   wake the poll through a [`Waker`]
//! - Timeouts are swept once per iteration before polling
//! - Sockets with leftover work (a full event channel, a capped read burst,
//!   a listener out of slots) make the next poll wait the throttle interval
//!   instead of the full poll wait

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;

use tidemq_core::framing::Protocol;

use crate::broker::Broker;
use crate::error::{NetError, Result};
use crate::events::{NetworkStatus, SocketEvent};
use crate::options::{DispatcherConfig, SocketOptions, THROTTLE_POLL_WAIT};
use crate::server::{AcceptedClient, ClientPool, ServerHandle, ServerSocket};
use crate::socket::{ActiveSocket, Socket, SocketHandle, SocketId};
use crate::tls::TlsSetup;
use crate::transmit::TransmitBuffer;

/// Token reserved for the waker. Socket ids start after it.
const WAKER: Token = Token(0);

/// Control requests from handles to the dispatcher thread.
pub(crate) enum Op {
    Add(Box<dyn ActiveSocket>),
    Start {
        id: SocketId,
        address: SocketAddr,
    },
    /// Restart at a freshly resolved address, or the previous one.
    Restart {
        id: SocketId,
        address: Option<SocketAddr>,
    },
    Stop(SocketId),
    Remove(SocketId),
    /// New data was queued on the socket.
    Flush(SocketId),
    Shutdown,
}

/// What a socket may touch while the dispatcher is driving it.
pub(crate) struct Context<'a> {
    now: Instant,
    accept_backoff: Duration,
    back_off: &'a mut AHashMap<SocketId, Instant>,
    added: &'a mut Vec<Box<dyn ActiveSocket>>,
}

impl<'a> Context<'a> {
    fn new(
        now: Instant,
        accept_backoff: Duration,
        back_off: &'a mut AHashMap<SocketId, Instant>,
        added: &'a mut Vec<Box<dyn ActiveSocket>>,
    ) -> Self {
        Self {
            now,
            accept_backoff,
            back_off,
            added,
        }
    }

    pub(crate) fn accept_backoff(&self) -> Duration {
        self.accept_backoff
    }

    /// Keep `id` out of the poll until the accept back-off elapses.
    pub(crate) fn back_off(&mut self, id: SocketId) {
        self.back_off.insert(id, self.now + self.accept_backoff);
    }

    fn is_backed_off(&self, id: SocketId) -> bool {
        self.back_off.get(&id).is_some_and(|until| *until > self.now)
    }

    /// Hand a newly accepted socket to the dispatcher.
    pub(crate) fn add(&mut self, socket: Box<dyn ActiveSocket>) {
        self.added.push(socket);
    }
}

/// Cloneable handle for creating sockets and talking to the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    ops: Sender<Op>,
    waker: Arc<Waker>,
    next_id: Arc<AtomicUsize>,
}

impl DispatcherHandle {
    pub(crate) fn send_op(&self, op: Op) -> Result<()> {
        self.ops.send(op).map_err(|_| NetError::DispatcherGone)?;
        self.waker.wake()?;
        Ok(())
    }

    pub(crate) fn allocate_id(&self) -> SocketId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an idle client socket. Call [`SocketHandle::start`] to connect.
    pub fn create_socket<P: Protocol>(
        &self,
        protocol: P,
        options: SocketOptions,
        tls: Option<TlsSetup>,
    ) -> Result<(SocketHandle<P::Packet>, Receiver<SocketEvent<P::Packet>>)> {
        let id = self.allocate_id();
        let tx = Arc::new(Mutex::new(TransmitBuffer::new(options.tx_queue_size)));
        let (events_tx, events_rx) = bounded(options.event_queue_size);
        let socket = Socket::new(id, protocol, options, tls, Arc::clone(&tx), events_tx);
        self.send_op(Op::Add(Box::new(socket)))?;
        Ok((SocketHandle::new(id, tx, self.clone()), events_rx))
    }

    /// Bind a listener and start accepting.
    ///
    /// At most `max_clients` accepted sockets exist at once; each gets a
    /// fresh protocol from `factory` and shows up on the returned receiver.
    pub fn create_server<P, F>(
        &self,
        address: SocketAddr,
        max_clients: usize,
        factory: F,
        options: SocketOptions,
        tls: Option<TlsSetup>,
    ) -> Result<(ServerHandle, Receiver<AcceptedClient<P::Packet>>)>
    where
        P: Protocol,
        F: Fn() -> P + Send + 'static,
    {
        let listener = mio::net::TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;
        let id = self.allocate_id();
        let pool = ClientPool::new(max_clients);
        let (accepted_tx, accepted_rx) = unbounded();
        let server = ServerSocket::new(
            id,
            listener,
            pool.clone(),
            factory,
            options,
            tls,
            accepted_tx,
            self.clone(),
        );
        self.send_op(Op::Add(Box::new(server)))?;
        info!("[{}] Listening on {}", id, local_addr);

        Ok((
            ServerHandle::new(id, local_addr, pool, self.clone()),
            accepted_rx,
        ))
    }

    /// Stop every socket and end the dispatcher loop.
    pub fn shutdown(&self) -> Result<()> {
        self.send_op(Op::Shutdown)
    }
}

/// Poll loop owning all sockets.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    config: DispatcherConfig,
    sockets: AHashMap<SocketId, Box<dyn ActiveSocket>>,
    back_off: AHashMap<SocketId, Instant>,
    /// Starts requested while the network was down.
    deferred: Vec<(SocketId, SocketAddr)>,
    has_network: bool,
    network: Option<Receiver<NetworkStatus>>,
    ops: Receiver<Op>,
    handle: DispatcherHandle,
    running: bool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (ops_tx, ops_rx) = unbounded();

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            config,
            sockets: AHashMap::new(),
            back_off: AHashMap::new(),
            deferred: Vec::new(),
            has_network: true,
            network: None,
            ops: ops_rx,
            handle: DispatcherHandle {
                ops: ops_tx,
                waker,
                next_id: Arc::new(AtomicUsize::new(WAKER.0 + 1)),
            },
            running: true,
        })
    }

    /// Run a dispatcher on its own thread.
    pub fn spawn(config: DispatcherConfig) -> Result<(DispatcherHandle, JoinHandle<()>)> {
        let mut dispatcher = Self::new(config)?;
        let handle = dispatcher.handle();
        let thread = thread::Builder::new()
            .name("tidemq-dispatcher".into())
            .spawn(move || {
                if let Err(e) = dispatcher.run() {
                    error!("Dispatcher failed: {}", e);
                }
            })?;
        Ok((handle, thread))
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Follow network availability published on `broker`.
    pub fn watch_network(&mut self, broker: &Broker) {
        self.network = Some(broker.subscribe::<NetworkStatus>());
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Run until shut down.
    pub fn run(&mut self) -> Result<()> {
        info!("Dispatcher started");
        while self.running {
            self.run_once()?;
        }
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Run a single iteration of the dispatcher loop.
    pub fn run_once(&mut self) -> Result<()> {
        self.apply_network_events();
        let flushes = self.apply_ops();
        if !self.running {
            return Ok(());
        }

        let now = Instant::now();
        self.check_socket_timeouts(now);
        self.back_off.retain(|id, until| {
            let keep = *until > now;
            if !keep {
                debug!("[{}] Back-off expired", id);
            }
            keep
        });

        let mut added = Vec::new();
        {
            let mut ctx = Context::new(now, self.config.accept_backoff, &mut self.back_off, &mut added);
            for id in flushes {
                if let Some(socket) = self.sockets.get_mut(&id) {
                    socket.drive(&mut ctx);
                }
            }
        }

        self.update_interests();

        let wait = if self.is_throttled() {
            THROTTLE_POLL_WAIT
        } else {
            self.config.poll_wait
        };
        if let Err(e) = self.poll.poll(&mut self.events, Some(wait)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let now = Instant::now();
        {
            let mut ctx = Context::new(now, self.config.accept_backoff, &mut self.back_off, &mut added);

            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER || ctx.is_backed_off(token.0) {
                    continue;
                }
                let Some(socket) = self.sockets.get_mut(&token.0) else {
                    continue;
                };

                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    socket.readable(&mut ctx);
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    socket.writable();
                }
            }

            for (id, socket) in self.sockets.iter_mut() {
                if !ctx.is_backed_off(*id) && socket.has_pending_work() {
                    socket.drive(&mut ctx);
                }
            }
        }

        for socket in added {
            self.sockets.insert(socket.id(), socket);
        }
        Ok(())
    }

    fn is_throttled(&self) -> bool {
        self.sockets
            .iter()
            .any(|(id, socket)| !self.back_off.contains_key(id) && socket.has_pending_work())
    }

    /// Apply queued control requests. Returns sockets that have new data queued.
    fn apply_ops(&mut self) -> Vec<SocketId> {
        let mut flushes = Vec::new();
        let before = self.sockets.len();

        while let Ok(op) = self.ops.try_recv() {
            match op {
                Op::Add(socket) => {
                    self.sockets.insert(socket.id(), socket);
                }
                Op::Start { id, address } => self.start_socket(id, address),
                Op::Restart { id, address } => {
                    let Some(socket) = self.sockets.get_mut(&id) else {
                        continue;
                    };
                    let address = address.or_else(|| socket.address());
                    socket.stop("Restarting");
                    match address {
                        Some(address) => self.start_socket(id, address),
                        None => warn!("[{}] Restart without an address", id),
                    }
                }
                Op::Stop(id) => {
                    if let Some(socket) = self.sockets.get_mut(&id) {
                        socket.stop("Stopped by owner");
                    }
                    self.forget_pending(id);
                }
                Op::Remove(id) => {
                    if let Some(mut socket) = self.sockets.remove(&id) {
                        socket.stop("Removed");
                    }
                    self.forget_pending(id);
                }
                Op::Flush(id) => {
                    if !flushes.contains(&id) {
                        flushes.push(id);
                    }
                }
                Op::Shutdown => {
                    for socket in self.sockets.values_mut() {
                        socket.stop("Dispatcher shutdown");
                    }
                    self.sockets.clear();
                    self.running = false;
                }
            }
        }

        if self.sockets.len() != before {
            debug!("Active sockets: {}", self.sockets.len());
        }
        flushes
    }

    fn forget_pending(&mut self, id: SocketId) {
        self.back_off.remove(&id);
        self.deferred.retain(|(deferred, _)| *deferred != id);
    }

    fn start_socket(&mut self, id: SocketId, address: SocketAddr) {
        if !self.has_network {
            debug!("[{}] Network down, deferring start at {}", id, address);
            self.deferred.retain(|(deferred, _)| *deferred != id);
            self.deferred.push((id, address));
            return;
        }
        if let Some(socket) = self.sockets.get_mut(&id) {
            if !socket.start(address) {
                debug!("[{}] Start at {} had no effect", id, address);
            }
        }
    }

    fn apply_network_events(&mut self) {
        let statuses: Vec<NetworkStatus> = match &self.network {
            Some(network) => network.try_iter().collect(),
            None => return,
        };

        for status in statuses {
            match status {
                NetworkStatus::Up if !self.has_network => {
                    info!("Network up, starting {} deferred sockets", self.deferred.len());
                    self.has_network = true;
                    for (id, address) in std::mem::take(&mut self.deferred) {
                        self.start_socket(id, address);
                    }
                }
                NetworkStatus::Down if self.has_network => {
                    warn!("Network down, closing all sockets");
                    self.has_network = false;
                    for (id, socket) in self.sockets.iter_mut() {
                        if !socket.is_active() {
                            continue;
                        }
                        // Listeners come back by themselves; clients are
                        // restarted by their owners
                        if socket.is_server() {
                            if let Some(address) = socket.address() {
                                self.deferred.push((*id, address));
                            }
                        }
                        socket.stop("Network down");
                    }
                }
                _ => {}
            }
        }
    }

    fn check_socket_timeouts(&mut self, now: Instant) {
        for socket in self.sockets.values_mut() {
            if let Some((reason, limit)) = socket.expired(now) {
                warn!(
                    "[{}] {} after {} ms",
                    socket.id(),
                    reason,
                    limit.as_millis()
                );
                socket.stop(reason);
            }
        }
    }

    /// Bring poll registrations in line with what each socket wants.
    fn update_interests(&mut self) {
        let registry = self.poll.registry();

        for (id, socket) in self.sockets.iter_mut() {
            let desired = if self.back_off.contains_key(id) {
                None
            } else {
                socket.interest()
            };
            let current = *socket.registration();
            if current == desired {
                continue;
            }

            let token = Token(*id);
            let result = match (socket.source(), current, desired) {
                (Some(source), None, Some(interest)) => registry.register(source, token, interest),
                (Some(source), Some(_), Some(interest)) => {
                    registry.reregister(source, token, interest)
                }
                (Some(source), Some(_), None) => registry.deregister(source),
                _ => Ok(()),
            };

            match result {
                Ok(()) => *socket.registration() = desired,
                Err(e) => {
                    error!("[{}] Failed to update poll registration: {}", id, e);
                    socket.stop("Poll registration failed");
                }
            }
        }
    }
}
