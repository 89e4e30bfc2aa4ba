//! Listening sockets and the client pool that bounds them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use parking_lot::Mutex;

use tidemq_core::framing::Protocol;

use crate::dispatcher::{Context, DispatcherHandle, Op};
use crate::error::Result;
use crate::events::SocketEvent;
use crate::options::SocketOptions;
use crate::socket::{ActiveSocket, Socket, SocketHandle, SocketId};
use crate::tls::TlsSetup;
use crate::transmit::TransmitBuffer;

/// Fixed number of client slots shared by a server and its accepted sockets.
#[derive(Debug, Clone)]
pub struct ClientPool {
    capacity: usize,
    in_use: Arc<AtomicUsize>,
}

impl ClientPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Claim a slot. The slot is released when the returned guard drops.
    pub fn try_acquire(&self) -> Option<PoolSlot> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(PoolSlot {
                        in_use: Arc::clone(&self.in_use),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }
}

/// A claimed pool slot.
#[derive(Debug)]
pub struct PoolSlot {
    in_use: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection accepted by a server socket.
pub struct AcceptedClient<T> {
    pub handle: SocketHandle<T>,
    pub events: Receiver<SocketEvent<T>>,
    pub peer: SocketAddr,
}

/// Application side of a server socket.
///
/// Dropping the handle closes the listener. Accepted clients keep running
/// until their own handles are dropped.
pub struct ServerHandle {
    id: SocketId,
    local_addr: SocketAddr,
    pool: ClientPool,
    dispatcher: DispatcherHandle,
}

impl ServerHandle {
    pub(crate) fn new(
        id: SocketId,
        local_addr: SocketAddr,
        pool: ClientPool,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            id,
            local_addr,
            pool,
            dispatcher,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Stop accepting new connections.
    pub fn stop(&self) -> Result<()> {
        self.dispatcher.send_op(Op::Stop(self.id))
    }

    /// Listen again on the bound address.
    pub fn start(&self) -> Result<()> {
        self.dispatcher.send_op(Op::Start {
            id: self.id,
            address: self.local_addr,
        })
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.dispatcher.send_op(Op::Remove(self.id));
    }
}

pub(crate) struct ServerSocket<P: Protocol, F> {
    id: SocketId,
    address: Option<SocketAddr>,
    listener: Option<TcpListener>,
    registered: Option<Interest>,
    pool: ClientPool,
    factory: F,
    options: SocketOptions,
    tls: Option<TlsSetup>,
    accepted: Sender<AcceptedClient<P::Packet>>,
    dispatcher: DispatcherHandle,
    accept_pending: bool,
}

impl<P, F> ServerSocket<P, F>
where
    P: Protocol,
    F: Fn() -> P + Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SocketId,
        listener: TcpListener,
        pool: ClientPool,
        factory: F,
        options: SocketOptions,
        tls: Option<TlsSetup>,
        accepted: Sender<AcceptedClient<P::Packet>>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            id,
            address: listener.local_addr().ok(),
            listener: Some(listener),
            registered: None,
            pool,
            factory,
            options,
            tls,
            accepted,
            dispatcher,
            accept_pending: false,
        }
    }

    /// Accept until the listener blocks. True if stopped for lack of slots.
    fn accept_all(&self, listener: &TcpListener, ctx: &mut Context<'_>) -> bool {
        loop {
            let Some(slot) = self.pool.try_acquire() else {
                debug!(
                    "[{}] Client pool exhausted, backing off for {:?}",
                    self.id,
                    ctx.accept_backoff()
                );
                ctx.back_off(self.id);
                return true;
            };

            match listener.accept() {
                Ok((stream, peer)) => self.spawn_client(stream, peer, slot, ctx),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("[{}] Error accepting connection: {}", self.id, e);
                    return false;
                }
            }
        }
    }

    fn spawn_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        slot: PoolSlot,
        ctx: &mut Context<'_>,
    ) {
        let id = self.dispatcher.allocate_id();
        let tx = Arc::new(Mutex::new(TransmitBuffer::new(self.options.tx_queue_size)));
        let (events_tx, events_rx) = bounded(self.options.event_queue_size);
        let socket = Socket::accepted(
            id,
            stream,
            peer,
            (self.factory)(),
            self.options.clone(),
            self.tls.clone(),
            Arc::clone(&tx),
            events_tx,
            slot,
        );
        ctx.add(Box::new(socket));
        debug!("[{}] Accepted connection {} from {}", self.id, id, peer);

        let client = AcceptedClient {
            handle: SocketHandle::new(id, tx, self.dispatcher.clone()),
            events: events_rx,
            peer,
        };
        if self.accepted.send(client).is_err() {
            warn!("[{}] No one to hand connection {} to, dropping it", self.id, id);
        }
    }
}

impl<P, F> ActiveSocket for ServerSocket<P, F>
where
    P: Protocol,
    F: Fn() -> P + Send + 'static,
{
    fn id(&self) -> SocketId {
        self.id
    }

    fn start(&mut self, address: SocketAddr) -> bool {
        if self.listener.is_some() {
            return false;
        }
        match TcpListener::bind(address) {
            Ok(listener) => {
                info!("[{}] Listening on {}", self.id, address);
                self.address = Some(address);
                self.listener = Some(listener);
                self.registered = None;
                true
            }
            Err(e) => {
                error!("[{}] Failed to listen on {}: {}", self.id, address, e);
                false
            }
        }
    }

    fn stop(&mut self, reason: &str) {
        if self.listener.take().is_some() {
            info!("[{}] Server stopping: {}", self.id, reason);
        }
        self.registered = None;
        self.accept_pending = false;
    }

    fn is_active(&self) -> bool {
        self.listener.is_some()
    }

    fn is_server(&self) -> bool {
        true
    }

    fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn interest(&self) -> Option<Interest> {
        self.listener.as_ref().map(|_| Interest::READABLE)
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        self.listener.as_mut().map(|l| l as &mut dyn Source)
    }

    fn registration(&mut self) -> &mut Option<Interest> {
        &mut self.registered
    }

    fn readable(&mut self, ctx: &mut Context<'_>) {
        self.accept_pending = match self.listener.as_ref() {
            Some(listener) => self.accept_all(listener, ctx),
            None => false,
        };
    }

    fn writable(&mut self) {}

    fn expired(&self, _now: Instant) -> Option<(&'static str, Duration)> {
        None
    }

    fn has_pending_work(&self) -> bool {
        self.accept_pending
    }

    fn drive(&mut self, ctx: &mut Context<'_>) {
        self.readable(ctx);
    }
}
