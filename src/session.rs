//! The session coordinator: composition root for one collaborative
//! document.
//!
//! ```text
//!                 ┌───────────── Session ─────────────┐
//!                 │                                    │
//!   substrate ───►│ SnapshotStore   PresenceService    │
//!                 │ UpdatePipeline  AwarenessPipeline  │
//!   connector ───►│            PeerManager             │
//!                 │                                    │
//!                 └──── DocumentReplica / Awareness ───┘
//! ```
//!
//! The session owns every subcomponent and every timer; subcomponents get
//! narrow capability closures (broadcast, apply) instead of references back
//! to the session, so teardown is a straight walk over owned resources.
//!
//! Startup order: replicas first, then the snapshot load, then presence,
//! then subscriptions and loops, then the peer manager. A failure after
//! the load never hides the loaded document — it surfaces as an `error`
//! event and the session carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessPipeline, AwarenessReplica};
use crate::config::{SessionConfig, HEARTBEAT_INTERVAL};
use crate::document::{DocumentReplica, UpdateOrigin};
use crate::error::EngineError;
use crate::events::{ConnectionStatus, EventBus, ListenerId, SessionEvent};
use crate::paths::DocumentPaths;
use crate::peer::{PeerManager, PeerSender};
use crate::presence::PresenceService;
use crate::snapshot::SnapshotStore;
use crate::substrate::Substrate;
use crate::transport::PeerConnector;
use crate::update::UpdatePipeline;

/// Snapshot of the session's bounded in-memory resources.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub message_buffer_bytes: usize,
    pub connection_count: usize,
    pub last_cleanup_ms: i64,
    pub awareness_states: usize,
    pub pending_reassemblies: usize,
}

/// One live collaborative document session.
pub struct Session {
    config: SessionConfig,
    doc: Arc<DocumentReplica>,
    awareness_replica: Arc<Mutex<AwarenessReplica>>,
    awareness: AwarenessPipeline,
    updates: UpdatePipeline,
    snapshot: SnapshotStore,
    presence: PresenceService,
    peers: PeerManager,
    events: EventBus,
    status: Arc<Mutex<ConnectionStatus>>,
    doc_sub: Mutex<Option<yrs::Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    disconnected: AtomicBool,
    hidden: Arc<AtomicBool>,
}

impl Session {
    /// Assemble a session. No I/O happens here; call [`Session::start`] to
    /// load state and join the mesh. Construction only fails on
    /// contradictory configuration (path layout).
    pub fn new(
        config: SessionConfig,
        substrate: Arc<dyn Substrate>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, EngineError> {
        let paths = DocumentPaths::resolve(&config.path_config, &config.doc_id)?;
        let events = EventBus::new();
        let status = Arc::new(Mutex::new(ConnectionStatus::Connecting));

        let doc = Arc::new(DocumentReplica::new());
        let mut replica = AwarenessReplica::new(doc.client_id());
        replica.set_local_state(json!({
            "user": { "name": config.user.name },
            "peerId": config.peer_id,
        }));
        let awareness_replica = Arc::new(Mutex::new(replica));

        let sender = PeerSender::new();
        let awareness =
            AwarenessPipeline::new(awareness_replica.clone(), sender.awareness_broadcaster());
        let updates = UpdatePipeline::new(doc.clone(), sender.sync_broadcaster());

        let presence = PresenceService::new(
            substrate.clone(),
            paths.clone(),
            config.peer_id.clone(),
            events.clone(),
        );
        let snapshot = SnapshotStore::new(
            substrate.clone(),
            paths.clone(),
            doc.clone(),
            config.doc_id.clone(),
            events.clone(),
        );
        let peers = PeerManager::new(
            config.peer_id.clone(),
            config.doc_id.clone(),
            config.max_direct_peers,
            config.stun_urls.clone(),
            substrate,
            connector,
            presence.clone(),
            doc.clone(),
            awareness.clone(),
            events.clone(),
            paths,
            status.clone(),
            sender,
        );

        Ok(Arc::new(Self {
            config,
            doc,
            awareness_replica,
            awareness,
            updates,
            snapshot,
            presence,
            peers,
            events,
            status,
            doc_sub: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            hidden: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Run the startup sequence. Only the very first call does anything.
    ///
    /// Failures during load, announce, or peer-manager init are reported
    /// through the `error` event (with a context tag) and do not abort the
    /// session: the document stays usable locally.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Config("session already started".into()));
        }
        log::info!(
            "starting session for doc {} as {}",
            self.config.doc_id,
            self.config.peer_id
        );
        self.events.emit(SessionEvent::ConnectionStateChanged {
            state: ConnectionStatus::Connecting,
        });

        // (2) Load the latest snapshot, if any.
        match self.snapshot.load().await {
            Ok(Some(bytes)) => match self.doc.apply_remote_update(&bytes) {
                Ok(()) => self.snapshot.mark_clean(),
                Err(e) => self.events.emit_error("load", e.to_string()),
            },
            Ok(None) => {}
            Err(e) => self.events.emit_error("load", e.to_string()),
        }

        // (3) Announce presence.
        if let Err(e) = self.presence.announce().await {
            self.events.emit_error("presence", e.to_string());
        }

        // (4) Origin-tagged update subscription feeding batching and
        // persistence. Remote applies dirty the snapshot but never echo.
        let updates = self.updates.clone();
        let snapshot = self.snapshot.clone();
        match self.doc.on_update(move |update, origin| {
            if origin == UpdateOrigin::Local {
                updates.notify_local_update(update);
            }
            snapshot.schedule_flush();
        }) {
            Ok(sub) => *self.doc_sub.lock().expect("doc sub") = Some(sub),
            Err(e) => self.events.emit_error("init", e.to_string()),
        }

        // (5) Snapshot backstop loop.
        let backstop = self.snapshot.spawn_backstop(self.config.sync_interval);

        // (6) Peer manager + heartbeat.
        if let Err(e) = self.peers.start().await {
            self.events.emit_error("init", e.to_string());
        }
        let presence = self.presence.clone();
        let events = self.events.clone();
        let hidden = self.hidden.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if hidden.load(Ordering::SeqCst) {
                    continue; // backgrounded tabs beat less
                }
                if let Err(e) = presence.heartbeat().await {
                    events.emit_error("presence", e.to_string());
                }
            }
        });

        self.tasks
            .lock()
            .expect("tasks")
            .extend([backstop, heartbeat]);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Public operations
    // ───────────────────────────────────────────────────────────────

    /// The document replica; edits made through it replicate to the mesh.
    pub fn document(&self) -> &Arc<DocumentReplica> {
        &self.doc
    }

    pub fn doc_id(&self) -> &str {
        &self.config.doc_id
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Subscribe to session events.
    pub fn on(&self, cb: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on(cb)
    }

    /// Remove an event listener.
    pub fn off(&self, id: ListenerId) {
        self.events.off(id);
    }

    /// Merge one field into the local awareness state and schedule its
    /// broadcast.
    pub fn set_awareness_field(&self, key: &str, value: serde_json::Value) {
        let changes = {
            let mut replica = self.awareness_replica.lock().expect("awareness");
            replica.set_local_field(key, value)
        };
        self.awareness.notify_local_change(&changes);
    }

    /// Peers currently in `connected` state.
    pub fn peer_count(&self) -> usize {
        self.peers.connected_count()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status")
    }

    /// Framer traffic totals: messages in/out, chunking, gate drops.
    pub fn traffic_stats(&self) -> crate::framing::TrafficStats {
        self.peers.traffic_stats()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let peer_stats = self.peers.memory_stats();
        MemoryStats {
            message_buffer_bytes: peer_stats.message_buffer_bytes,
            connection_count: peer_stats.connection_count,
            last_cleanup_ms: peer_stats.last_cleanup_ms,
            awareness_states: self
                .awareness_replica
                .lock()
                .expect("awareness")
                .cardinality(),
            pending_reassemblies: peer_stats.pending_reassemblies,
        }
    }

    /// Write a snapshot now, dirty or not. Errors propagate to the caller.
    pub async fn force_persist(&self) -> Result<(), EngineError> {
        self.snapshot.flush(true).await.map(|_| ())
    }

    /// Write a labeled snapshot at `snapshots/{label}_{ts}`.
    pub async fn persist_labeled(&self, label: &str) -> Result<String, EngineError> {
        self.snapshot.write_labeled(label).await
    }

    /// No-op: the document runs incremental GC continuously.
    pub fn force_garbage_collection(&self) {}

    /// Tear the whole session down. Idempotent and safe from any state:
    /// timers stop, peers close, subscriptions detach, the presence record
    /// goes away best-effort, and the awareness replica is emptied.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("disconnecting session {}", self.config.peer_id);

        self.updates.shutdown();
        self.awareness.shutdown();
        self.snapshot.shutdown();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("tasks");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }

        // Peer manager detaches its substrate subscriptions before the
        // presence record is removed, so our own removal is not observed.
        self.peers.shutdown().await;
        self.presence.stop().await;

        self.doc_sub.lock().expect("doc sub").take();
        {
            let mut replica = self.awareness_replica.lock().expect("awareness");
            let ids: Vec<u64> = replica.states().map(|(id, _)| id).collect();
            replica.remove_states(&ids);
        }

        *self.status.lock().expect("status") = ConnectionStatus::Disconnected;
        self.events.emit(SessionEvent::ConnectionStateChanged {
            state: ConnectionStatus::Disconnected,
        });
    }

    /// Tear down the mesh layer and rejoin it. Emits `connecting`
    /// immediately, then `connected` or `disconnected` when the peer
    /// manager is back. Errors propagate after being reported.
    pub async fn reconnect(&self) -> Result<(), EngineError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(EngineError::Config(
                "cannot reconnect a disconnected session".into(),
            ));
        }
        log::info!("reconnecting session {}", self.config.peer_id);
        {
            let mut status = self.status.lock().expect("status");
            *status = ConnectionStatus::Connecting;
        }
        self.events.emit(SessionEvent::ConnectionStateChanged {
            state: ConnectionStatus::Connecting,
        });

        self.peers.shutdown().await;

        let result = async {
            self.presence.announce().await.map_err(EngineError::from)?;
            self.peers.start().await
        }
        .await;

        match result {
            Ok(()) => {
                let state = if self.peers.connected_count() > 0 {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Disconnected
                };
                *self.status.lock().expect("status") = state;
                self.events
                    .emit(SessionEvent::ConnectionStateChanged { state });
                Ok(())
            }
            Err(e) => {
                self.events.emit_error("reconnect", e.to_string());
                Err(e)
            }
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Page lifecycle
    // ───────────────────────────────────────────────────────────────

    /// Tab went to the background: keep connections, beat less.
    pub fn notify_hidden(&self) {
        self.hidden.store(true, Ordering::SeqCst);
    }

    /// Tab is visible again: force a (rate-limited) heartbeat, and if the
    /// mesh silently died while hidden, drop the husks so discovery can
    /// rebuild it.
    pub async fn notify_visible(&self) {
        self.hidden.store(false, Ordering::SeqCst);
        if let Err(e) = self.presence.on_visible().await {
            self.events.emit_error("presence", e.to_string());
        }
        if self.peers.connected_count() == 0 && !self.peers.peer_ids().await.is_empty() {
            self.peers.drop_unconnected().await;
        }
    }

    /// Unload path: fire-and-forget snapshot write and presence removal.
    pub fn flush_before_close(&self) {
        let snapshot = self.snapshot.clone();
        let presence = self.presence.clone();
        tokio::spawn(async move {
            if let Err(e) = snapshot.flush(false).await {
                log::debug!("final flush failed: {e}");
            }
            presence.stop().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;
    use crate::transport::MemoryRtc;

    fn session_for(doc_id: &str) -> Arc<Session> {
        let substrate = Arc::new(MemorySubstrate::new());
        let rtc = MemoryRtc::new();
        Session::new(SessionConfig::new(doc_id), substrate, rtc.connector()).unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let session = session_for("doc");
        session.start().await.unwrap();
        assert!(session.start().await.is_err());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_initial_status_is_connecting() {
        let session = session_for("doc");
        assert_eq!(session.connection_status(), ConnectionStatus::Connecting);
        assert_eq!(session.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_quiet() {
        let session = session_for("doc");
        session.start().await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_rejected() {
        let session = session_for("doc");
        session.start().await.unwrap();
        session.disconnect().await;
        assert!(session.reconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_stats_shape() {
        let session = session_for("doc");
        session.start().await.unwrap();
        let stats = session.memory_stats();
        assert_eq!(stats.connection_count, 0);
        assert_eq!(stats.awareness_states, 1); // our own state
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_force_gc_is_noop() {
        let session = session_for("doc");
        session.force_garbage_collection();
    }
}
