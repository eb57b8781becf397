//! # Event Bus
//!
//! In-process registry of connection listeners. The connection task calls
//! [`EventBus::publish`] from its I/O context; listeners therefore must not
//! block. Delivery is in registration order, and a panicking listener is
//! contained and logged so one broken handler cannot take down connection
//! handling.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use crate::protocol::ResponseEnvelope;

/// The three kinds of connection events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ListenerKind {
    Open,
    Close,
    Receive,
}

/// A connection lifecycle event with its fixed payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The session reached open state; `status` is the HTTP status of the
    /// handshake response.
    Opened { status: u16 },
    /// The session closed. `remote` is true when the peer initiated it.
    Closed { code: u16, reason: String, remote: bool },
    /// A decoded reply envelope arrived.
    Received { envelope: ResponseEnvelope },
}

impl ConnectionEvent {
    pub fn kind(&self) -> ListenerKind {
        match self {
            ConnectionEvent::Opened { .. } => ListenerKind::Open,
            ConnectionEvent::Closed { .. } => ListenerKind::Close,
            ConnectionEvent::Received { .. } => ListenerKind::Receive,
        }
    }
}

/// A registered event handler.
///
/// Handlers run on the connection's I/O context and must return quickly.
pub trait Listener: Send + Sync {
    fn kind(&self) -> ListenerKind;
    fn on_event(&self, event: &ConnectionEvent);
}

/// Ordered listener registry, owned by the driver instance.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Listeners fire in registration order.
    pub fn register(&self, listener: Arc<dyn Listener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes a previously registered listener (by identity).
    pub fn unregister(&self, listener: &Arc<dyn Listener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers `event` to every listener of the matching kind, in
    /// registration order. A panicking listener is isolated and logged.
    pub fn publish(&self, event: &ConnectionEvent) {
        debug!(kind = %event.kind(), "publishing connection event");
        let targets: Vec<Arc<dyn Listener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|listener| listener.kind() == event.kind())
            .cloned()
            .collect();

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                error!(
                    kind = %event.kind(),
                    "a connection listener panicked; isolating it from connection handling"
                );
            }
        }
    }
}
