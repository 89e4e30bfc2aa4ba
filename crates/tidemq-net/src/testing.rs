//! Helpers shared by the loopback tests.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::events::{ConnectionStatus, SocketEvent};
use crate::options::DispatcherConfig;

pub(crate) const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn spawn_dispatcher() -> (DispatcherHandle, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    Dispatcher::spawn(DispatcherConfig::default().accept_backoff(Duration::from_millis(100)))
        .unwrap()
}

pub(crate) fn next_event<T>(events: &Receiver<SocketEvent<T>>) -> SocketEvent<T> {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for socket event")
}

pub(crate) fn expect_connected<T: std::fmt::Debug>(events: &Receiver<SocketEvent<T>>) {
    loop {
        match next_event(events) {
            SocketEvent::ConnectionStatus(ConnectionStatus::Connected(_)) => return,
            SocketEvent::TransmitBufferEmpty => {}
            other => panic!("expected connect, got {:?}", other),
        }
    }
}

/// Waits for a disconnect, skipping data, and returns its reason.
pub(crate) fn expect_disconnected<T>(events: &Receiver<SocketEvent<T>>) -> String {
    loop {
        if let SocketEvent::ConnectionStatus(ConnectionStatus::Disconnected { reason }) =
            next_event(events)
        {
            return reason;
        }
    }
}
