//! Explicit event registry.
//!
//! Connection events fan out through a small emitter keyed by event name
//! rather than any host runtime's event system, so the core stays
//! portable. Every parsed application frame is emitted twice: once as
//! [`event::MESSAGE`] and once under the frame's own `type` field.

use crate::connection::ConnectionState;
use crate::protocol::SessionInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Well-known event names emitted by a connection.
pub mod event {
    /// Fired on every state transition, payload [`EventPayload::State`]
    pub const STATE_CHANGE: &str = "state_change";
    /// Auth handshake completed, payload [`EventPayload::Session`]
    pub const CONNECTED: &str = "connected";
    /// Socket closed, payload [`EventPayload::Closed`]
    pub const DISCONNECTED: &str = "disconnected";
    /// Every parsed application frame once connected
    pub const MESSAGE: &str = "message";
    /// Raw binary frame, bypasses JSON parsing entirely
    pub const BINARY_MESSAGE: &str = "binary_message";
    /// Any recoverable error
    pub const ERROR: &str = "error";
    /// Socket-level open/send failure
    pub const CONNECTION_ERROR: &str = "connection_error";
    /// Server rejected the auth handshake
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    /// No auth reply within the handshake deadline
    pub const AUTHENTICATION_TIMEOUT: &str = "authentication_timeout";
    /// A reconnect has been scheduled, payload [`EventPayload::Reconnecting`]
    pub const RECONNECTING: &str = "reconnecting";
    /// Reconnect attempts exhausted; connect() must be called again
    pub const MAX_RECONNECT_ATTEMPTS: &str = "max_reconnect_attempts_reached";
    /// An outbound message was dropped because the queue was full
    pub const QUEUE_OVERFLOW: &str = "queue_overflow";
}

/// Payload delivered to event handlers.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// New connection state
    State(ConnectionState),
    /// Session details from auth_success
    Session(SessionInfo),
    /// Close code and reason
    Closed { code: u16, reason: String },
    /// Parsed application frame
    Frame(serde_json::Value),
    /// Raw binary frame
    Binary(Vec<u8>),
    /// Error description
    Error(String),
    /// Scheduled reconnect (attempt is 1-based)
    Reconnecting { attempt: u32, delay: Duration },
}

type EventHandler = Arc<dyn Fn(&EventPayload) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

/// Multi-subscriber event emitter keyed by event name.
///
/// Cloning is cheap and shares the handler registry. Emitting an event
/// with no subscribers is a no-op. Handlers run on the connection task,
/// so they should hand heavy work off rather than block.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name.
    ///
    /// Multiple handlers may be registered for the same event; they are
    /// invoked in registration order.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(&EventPayload) + Send + Sync + 'static,
    ) -> EventSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        EventSubscription {
            bus: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
        }
    }

    /// Emit an event to all registered handlers.
    pub fn emit(&self, event: &str, payload: &EventPayload) {
        // Clone the handler list out of the lock so handlers can
        // subscribe/unsubscribe without deadlocking.
        let handlers: Vec<EventHandler> = {
            let map = self.inner.handlers.read();
            match map.get(event) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(payload);
        }
    }

    /// Number of handlers registered for an event
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::on`]; detaches the handler on
/// [`EventSubscription::unsubscribe`]. Dropping the handle without
/// unsubscribing leaves the handler attached, so observers can subscribe
/// and forget when they live as long as the connection.
pub struct EventSubscription {
    bus: Weak<BusInner>,
    event: String,
    id: u64,
}

impl EventSubscription {
    /// Remove the handler from the bus
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut map = bus.handlers.write();
            if let Some(list) = map.get_mut(&self.event) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    map.remove(&self.event);
                }
            }
        }
    }
}
