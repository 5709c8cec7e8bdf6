//! Shared fixtures for the behavioural suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    ConnectionObserver, DisconnectReason, IncomingConnection, Router, RouterOptions, connect,
};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Both ends of one loopback connection.
pub(crate) struct ConnectedPair {
    pub(crate) controller: Router,
    pub(crate) agent: Router,
}

/// Connects an agent back to a freshly prepared controller listener.
pub(crate) fn connected_pair(
    controller_options: &RouterOptions,
    agent_options: &RouterOptions,
) -> ConnectedPair {
    let incoming = IncomingConnection::prepare(controller_options).expect("prepare listener");
    let agent = connect("127.0.0.1", incoming.local_port(), agent_options).expect("agent dials");
    let controller = incoming
        .wait_for_connection(ACCEPT_TIMEOUT)
        .expect("controller accepts");
    ConnectedPair { controller, agent }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    condition()
}

/// Observer that counts lifecycle notifications.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    connections: AtomicUsize,
    disconnections: AtomicUsize,
    reasons: Mutex<Vec<DisconnectReason>>,
}

impl RecordingObserver {
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnections(&self) -> usize {
        self.disconnections.load(Ordering::SeqCst)
    }

    pub(crate) fn reasons(&self) -> Vec<DisconnectReason> {
        self.reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConnectionObserver for RecordingObserver {
    fn connected(&self, _peer: &str) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self, _peer: &str, reason: &DisconnectReason) {
        self.disconnections.fetch_add(1, Ordering::SeqCst);
        self.reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reason.clone());
    }
}

pub(crate) fn strip_quotes(value: &str) -> &str {
    value.trim_matches('"')
}
