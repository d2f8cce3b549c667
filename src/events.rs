//! Typed session events and the listener registry.
//!
//! The engine reports everything observable through a single [`SessionEvent`]
//! enum. Listeners are plain callbacks registered with [`EventBus::on`] and
//! removed with the returned [`ListenerId`]; emission is synchronous and
//! never fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::UserInfo;

/// Coarse connection status of the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

/// Everything a session can tell its embedder.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged {
        state: ConnectionStatus,
    },
    PeerJoined {
        peer_id: String,
        user: Option<UserInfo>,
    },
    PeerLeft {
        peer_id: String,
    },
    DocumentPersisted {
        doc_id: String,
        version: u64,
    },
    SyncCompleted {
        doc_id: String,
        update_size: usize,
    },
    AwarenessUpdated {
        peer_id: String,
        user: Option<UserInfo>,
    },
    /// A non-fatal failure, tagged with the subsystem it came from.
    Error {
        context: &'static str,
        message: String,
    },
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Listener registry shared between the session and its subcomponents.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all session events.
    pub fn on(&self, listener: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("event bus poisoned")
            .insert(id, Arc::new(listener));
        ListenerId(id)
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .expect("event bus poisoned")
            .remove(&id.0);
    }

    /// Deliver an event to every registered listener.
    ///
    /// Listeners are snapshotted first so a callback may call `on`/`off`
    /// without deadlocking.
    pub fn emit(&self, event: SessionEvent) {
        let listeners: Vec<Listener> = {
            let guard = self.inner.listeners.lock().expect("event bus poisoned");
            guard.values().cloned().collect()
        };
        for listener in listeners {
            listener(&event);
        }
    }

    /// Shorthand for emitting an `error` event.
    pub fn emit_error(&self, context: &'static str, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[{context}] {message}");
        self.emit(SessionEvent::Error { context, message });
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().expect("event bus poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_off_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        let id = bus.on(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SessionEvent::PeerLeft {
            peer_id: "p".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.off(id);
        bus.emit(SessionEvent::PeerLeft {
            peer_id: "p".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let bus = EventBus::new();
        let bus2 = bus.clone();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();

        let id = bus.on(move |_| {
            if let Some(id) = slot2.lock().unwrap().take() {
                bus2.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(SessionEvent::ConnectionStateChanged {
            state: ConnectionStatus::Connecting,
        });
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ConnectionStatus::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionStatus::Connected.as_str(), "connected");
        assert_eq!(ConnectionStatus::Disconnected.as_str(), "disconnected");
    }
}
