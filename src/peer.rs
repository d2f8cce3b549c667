//! Peer connection management: discovery, negotiation, fan-out, teardown.
//!
//! ```text
//! rooms/peers child events ──┐
//! signaling inbox ───────────┤
//! transport callbacks ───────┼──► command queue ──► driver task
//! pipeline broadcasts ───────┤         (mpsc)       (one per session)
//! cleanup interval ──────────┘
//! ```
//!
//! Everything that mutates peer state funnels through one driver task, so
//! negotiation steps, incoming frames, and teardown never interleave
//! mid-operation.
//!
//! Initiation is deterministic: for any pair, the lexicographically smaller
//! id creates the connection and data channel and sends the offer; the
//! larger id answers. ICE is non-trickled — each side waits for gathering
//! to complete and ships exactly one envelope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::awareness::AwarenessPipeline;
use crate::config::{
    epoch_ms, CLEANUP_INTERVAL, IDLE_PEER_TIMEOUT, PEER_PRESENCE_TIMEOUT,
    STALE_CONNECTION_TIMEOUT,
};
use crate::document::DocumentReplica;
use crate::error::EngineError;
use crate::events::{ConnectionStatus, EventBus, SessionEvent};
use crate::framing::{
    encode_frames, FrameKind, MessageBuffer, ReassemblyBuffers, TrafficCounters, TrafficStats,
    WireEnvelope,
};
use crate::paths::DocumentPaths;
use crate::presence::{PeerRecord, PresenceService};
use crate::signaling::{InboxItem, SignalEnvelope, SignalingChannel};
use crate::substrate::{Substrate, SubscriptionId};
use crate::transport::{
    DataChannel, IceConfig, PeerConnection, PeerConnectionState, PeerConnector, SdpType,
    SignalingState,
};

/// Negotiation phase of one peer slot, initiator and responder alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerPhase {
    Offering,
    GatheringLocal,
    Offered,
    Answering,
    Connected,
}

struct PeerHandle {
    /// Generation tag; transport callbacks carry it so events from an
    /// already-replaced connection cannot touch its successor.
    conn_id: u64,
    connection: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    phase: PeerPhase,
    initiated_by_us: bool,
    created_at: Instant,
    last_activity: Instant,
}

/// Everything that can wake the driver.
pub enum PeerCommand {
    PeerSeen {
        peer_id: String,
        record: PeerRecord,
    },
    PeerGone {
        peer_id: String,
    },
    Inbox(InboxItem),
    IncomingChannel {
        peer_id: String,
        conn_id: u64,
        channel: Arc<dyn DataChannel>,
    },
    ChannelOpen {
        peer_id: String,
        conn_id: u64,
    },
    ChannelMessage {
        peer_id: String,
        conn_id: u64,
        data: Vec<u8>,
    },
    ChannelClosed {
        peer_id: String,
        conn_id: u64,
    },
    ConnectionState {
        peer_id: String,
        conn_id: u64,
        state: PeerConnectionState,
    },
    BroadcastSync {
        update: Vec<u8>,
    },
    BroadcastAwareness {
        update: Vec<u8>,
        compressed: bool,
    },
    CleanupTick,
}

/// Shared handle onto the driver's command queue.
///
/// Exists separately from [`PeerManager`] so the update and awareness
/// pipelines can be built with broadcast capabilities before the manager
/// itself, breaking what would otherwise be a construction cycle. Armed by
/// `start`, disarmed by `shutdown`; sends while disarmed vanish.
#[derive(Clone, Default)]
pub struct PeerSender {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<PeerCommand>>>>,
}

impl PeerSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn send(&self, command: PeerCommand) {
        if let Some(tx) = self.tx.lock().expect("tx").as_ref() {
            let _ = tx.send(command);
        }
    }

    fn arm(&self) -> Result<mpsc::UnboundedReceiver<PeerCommand>, EngineError> {
        let mut guard = self.tx.lock().expect("tx");
        if guard.is_some() {
            return Err(EngineError::Config("peer manager already started".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        Ok(rx)
    }

    fn disarm(&self) {
        self.tx.lock().expect("tx").take();
    }

    /// Capability for the update pipeline: queue a sync broadcast.
    pub fn sync_broadcaster(&self) -> Arc<dyn Fn(Vec<u8>) + Send + Sync> {
        let sender = self.clone();
        Arc::new(move |update| {
            sender.send(PeerCommand::BroadcastSync { update });
        })
    }

    /// Capability for the awareness pipeline: queue an awareness broadcast.
    pub fn awareness_broadcaster(&self) -> Arc<dyn Fn(Vec<u8>, bool) + Send + Sync> {
        let sender = self.clone();
        Arc::new(move |update, compressed| {
            sender.send(PeerCommand::BroadcastAwareness { update, compressed });
        })
    }
}

/// Point-in-time memory report for `getMemoryStats`.
#[derive(Debug, Clone, Default)]
pub struct PeerMemoryStats {
    pub message_buffer_bytes: usize,
    pub connection_count: usize,
    pub last_cleanup_ms: i64,
    pub pending_reassemblies: usize,
}

#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    self_id: String,
    doc_id: String,
    max_direct_peers: usize,
    ice: IceConfig,
    substrate: Arc<dyn Substrate>,
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingChannel,
    presence: PresenceService,
    doc: Arc<DocumentReplica>,
    awareness: AwarenessPipeline,
    events: EventBus,
    paths: DocumentPaths,
    status: Arc<Mutex<ConnectionStatus>>,

    tx: PeerSender,

    peers: tokio::sync::Mutex<HashMap<String, PeerHandle>>,
    /// Last state vector each peer is known to have, kept across
    /// reconnects so a re-paired peer gets a delta, not the world.
    known_vectors: Mutex<HashMap<String, Vec<u8>>>,
    next_conn_id: AtomicU64,
    connected_count: AtomicUsize,
    reassembly: Mutex<ReassemblyBuffers>,
    message_buffer: Mutex<MessageBuffer>,
    traffic: TrafficCounters,
    last_cleanup_ms: AtomicI64,

    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: impl Into<String>,
        doc_id: impl Into<String>,
        max_direct_peers: usize,
        stun_urls: Vec<String>,
        substrate: Arc<dyn Substrate>,
        connector: Arc<dyn PeerConnector>,
        presence: PresenceService,
        doc: Arc<DocumentReplica>,
        awareness: AwarenessPipeline,
        events: EventBus,
        paths: DocumentPaths,
        status: Arc<Mutex<ConnectionStatus>>,
        sender: PeerSender,
    ) -> Self {
        let self_id = self_id.into();
        let signaling = SignalingChannel::new(substrate.clone(), paths.clone(), self_id.clone());
        Self {
            inner: Arc::new(PeerInner {
                self_id,
                doc_id: doc_id.into(),
                max_direct_peers,
                ice: IceConfig { stun_urls },
                substrate,
                connector,
                signaling,
                presence,
                doc,
                awareness,
                events,
                paths,
                status,
                tx: sender,
                peers: tokio::sync::Mutex::new(HashMap::new()),
                known_vectors: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                connected_count: AtomicUsize::new(0),
                reassembly: Mutex::new(ReassemblyBuffers::new()),
                message_buffer: Mutex::new(MessageBuffer::new()),
                traffic: TrafficCounters::new(),
                last_cleanup_ms: AtomicI64::new(0),
                subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wire subscriptions, start the driver and the cleanup ticker.
    pub async fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let rx = inner.tx.arm()?;

        // Discovery: peer records appearing and vanishing.
        let cb_inner = inner.clone();
        let added = inner
            .substrate
            .subscribe_child_added(
                &inner.paths.peers(),
                Arc::new(move |key, value| {
                    if let Some(record) = PeerRecord::parse(value) {
                        cb_inner.send(PeerCommand::PeerSeen {
                            peer_id: key.to_string(),
                            record,
                        });
                    } else {
                        log::warn!("unreadable peer record at {key}");
                    }
                }),
            )
            .await?;
        let cb_inner = inner.clone();
        let removed = inner
            .substrate
            .subscribe_child_removed(
                &inner.paths.peers(),
                Arc::new(move |key| {
                    cb_inner.send(PeerCommand::PeerGone {
                        peer_id: key.to_string(),
                    });
                }),
            )
            .await?;
        inner
            .subscriptions
            .lock()
            .expect("subscriptions")
            .extend([added, removed]);

        // Signaling inbox.
        let (sub, mut inbox_rx) = inner.signaling.listen().await?;
        inner.subscriptions.lock().expect("subscriptions").push(sub);
        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            while let Some(item) = inbox_rx.recv().await {
                pump_inner.send(PeerCommand::Inbox(item));
            }
        });

        // Driver.
        let manager = self.clone();
        let driver = tokio::spawn(async move { manager.drive(rx).await });

        // Memory governance.
        let tick_inner = inner.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                tick_inner.send(PeerCommand::CleanupTick);
            }
        });

        inner
            .tasks
            .lock()
            .expect("tasks")
            .extend([pump, driver, ticker]);
        log::info!("peer manager started for {}", inner.self_id);
        Ok(())
    }

    /// Stop everything: subscriptions, tasks, connections. Idempotent, and
    /// `start` can be called again afterwards (reconnect path).
    pub async fn shutdown(&self) {
        self.inner.tx.disarm();

        let subs: Vec<SubscriptionId> = {
            let mut guard = self.inner.subscriptions.lock().expect("subscriptions");
            std::mem::take(&mut *guard)
        };
        for sub in subs {
            self.inner.substrate.unsubscribe(sub).await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().expect("tasks");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }

        let handles: Vec<(String, PeerHandle)> = {
            let mut peers = self.inner.peers.lock().await;
            peers.drain().collect()
        };
        for (peer_id, handle) in handles {
            if let Some(channel) = &handle.channel {
                channel.close();
            }
            handle.connection.close().await;
            log::debug!("closed connection to {peer_id} during shutdown");
        }
        self.inner.connected_count.store(0, Ordering::SeqCst);
        self.inner
            .reassembly
            .lock()
            .expect("reassembly")
            .prune_older_than(-1);
        self.inner
            .known_vectors
            .lock()
            .expect("known vectors")
            .clear();
    }

    pub fn connected_count(&self) -> usize {
        self.inner.connected_count.load(Ordering::SeqCst)
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.inner.peers.lock().await.keys().cloned().collect()
    }

    pub async fn connected_peer_ids(&self) -> Vec<String> {
        let peers = self.inner.peers.lock().await;
        peers
            .iter()
            .filter(|(_, h)| h.phase == PeerPhase::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Framer traffic totals since startup.
    pub fn traffic_stats(&self) -> TrafficStats {
        self.inner.traffic.snapshot()
    }

    pub fn memory_stats(&self) -> PeerMemoryStats {
        PeerMemoryStats {
            message_buffer_bytes: self
                .inner
                .message_buffer
                .lock()
                .expect("message buffer")
                .total_bytes(),
            connection_count: self.inner.connected_count.load(Ordering::SeqCst),
            last_cleanup_ms: self.inner.last_cleanup_ms.load(Ordering::SeqCst),
            pending_reassemblies: self
                .inner
                .reassembly
                .lock()
                .expect("reassembly")
                .pending_messages(),
        }
    }

    /// Visible-again recovery: when nothing is connected but slots exist,
    /// drop them all and let discovery re-pair the mesh.
    pub async fn drop_unconnected(&self) {
        let doomed: Vec<String> = {
            let peers = self.inner.peers.lock().await;
            if peers.values().any(|h| h.phase == PeerPhase::Connected) {
                return;
            }
            peers.keys().cloned().collect()
        };
        for peer_id in doomed {
            self.teardown(&peer_id, "stale after visibility change").await;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Driver
    // ───────────────────────────────────────────────────────────────

    async fn drive(self, mut rx: mpsc::UnboundedReceiver<PeerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PeerCommand::PeerSeen { peer_id, record } => {
                    self.on_peer_seen(peer_id, record).await;
                }
                PeerCommand::PeerGone { peer_id } => {
                    if peer_id == self.inner.self_id {
                        // A remote cleanup reaped our record; republish so
                        // discovery can still find us.
                        if let Err(e) = self.inner.presence.heartbeat().await {
                            self.inner.events.emit_error("presence", e.to_string());
                        }
                    } else {
                        self.teardown(&peer_id, "presence record removed").await;
                    }
                }
                PeerCommand::Inbox(item) => match item {
                    InboxItem::Envelope { key, envelope } => {
                        self.on_signal(envelope).await;
                        self.inner.signaling.ack(&key).await;
                    }
                    InboxItem::Malformed { key } => {
                        self.inner.signaling.ack(&key).await;
                    }
                },
                PeerCommand::IncomingChannel {
                    peer_id,
                    conn_id,
                    channel,
                } => {
                    self.on_incoming_channel(peer_id, conn_id, channel).await;
                }
                PeerCommand::ChannelOpen { peer_id, conn_id } => {
                    if self.is_current(&peer_id, conn_id).await {
                        self.on_channel_open(&peer_id).await;
                    }
                }
                PeerCommand::ChannelMessage {
                    peer_id,
                    conn_id,
                    data,
                } => {
                    if self.is_current(&peer_id, conn_id).await {
                        self.on_channel_message(&peer_id, data).await;
                    }
                }
                PeerCommand::ChannelClosed { peer_id, conn_id } => {
                    if self.is_current(&peer_id, conn_id).await {
                        self.teardown(&peer_id, "data channel closed").await;
                    }
                }
                PeerCommand::ConnectionState {
                    peer_id,
                    conn_id,
                    state,
                } => {
                    if self.is_current(&peer_id, conn_id).await {
                        self.on_connection_state(&peer_id, state).await;
                    }
                }
                PeerCommand::BroadcastSync { update } => {
                    self.broadcast(FrameKind::Sync, &update).await;
                }
                PeerCommand::BroadcastAwareness { update, compressed } => {
                    self.broadcast(FrameKind::Awareness { compressed }, &update).await;
                }
                PeerCommand::CleanupTick => {
                    self.cleanup_tick().await;
                }
            }
        }
    }

    async fn on_peer_seen(&self, peer_id: String, record: PeerRecord) {
        if peer_id == self.inner.self_id {
            return;
        }
        if !record.is_live(epoch_ms(), PEER_PRESENCE_TIMEOUT) {
            log::debug!("ignoring stale peer record for {peer_id}");
            return;
        }
        // Only the lexicographically smaller id initiates; glare-free.
        if self.inner.self_id >= peer_id {
            return;
        }
        {
            let peers = self.inner.peers.lock().await;
            if peers.contains_key(&peer_id) {
                return; // re-announcement for a live slot is a no-op
            }
            if peers.len() >= self.inner.max_direct_peers {
                log::warn!(
                    "peer ceiling ({}) reached; not initiating to {peer_id}",
                    self.inner.max_direct_peers
                );
                return;
            }
        }
        if let Err(e) = self.initiate(&peer_id).await {
            self.inner
                .events
                .emit_error("peer-connection", format!("initiate to {peer_id}: {e}"));
            self.teardown(&peer_id, "initiation failed").await;
        }
    }

    /// Whether `conn_id` is still the live slot for `peer_id`; stale
    /// transport events fail this and are dropped.
    async fn is_current(&self, peer_id: &str, conn_id: u64) -> bool {
        let peers = self.inner.peers.lock().await;
        peers.get(peer_id).map(|h| h.conn_id == conn_id).unwrap_or(false)
    }

    /// Initiator path: channel first, then offer, then gathered SDP out.
    async fn initiate(&self, peer_id: &str) -> Result<(), EngineError> {
        log::info!("initiating connection to {peer_id}");
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let connection = self.inner.connector.create_connection(&self.inner.ice).await?;
        self.wire_connection(peer_id, conn_id, &connection);

        let channel = connection.create_data_channel("data").await?;
        self.wire_channel(peer_id, conn_id, &channel);

        {
            let mut peers = self.inner.peers.lock().await;
            peers.insert(
                peer_id.to_string(),
                PeerHandle {
                    conn_id,
                    connection: connection.clone(),
                    channel: Some(channel),
                    phase: PeerPhase::Offering,
                    initiated_by_us: true,
                    created_at: Instant::now(),
                    last_activity: Instant::now(),
                },
            );
        }

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer).await?;
        self.set_phase(peer_id, PeerPhase::GatheringLocal).await;
        connection.wait_ice_gathering_complete().await?;

        let gathered = connection
            .local_description()
            .await
            .ok_or_else(|| EngineError::Config("no local description after gathering".into()))?;
        self.inner.signaling.send(peer_id, gathered).await?;
        self.set_phase(peer_id, PeerPhase::Offered).await;
        Ok(())
    }

    async fn on_signal(&self, envelope: SignalEnvelope) {
        let from = envelope.from.clone();
        let result = match envelope.kind {
            SdpType::Offer => self.on_offer(envelope).await,
            SdpType::Answer => self.on_answer(envelope).await,
        };
        if let Err(e) = result {
            self.inner
                .events
                .emit_error("signaling", format!("from {from}: {e}"));
            self.teardown(&from, "signaling failure").await;
        }
    }

    /// Responder path: matching config, remote offer in, gathered answer out.
    async fn on_offer(
        &self,
        envelope: SignalEnvelope,
    ) -> Result<(), EngineError> {
        let peer_id = envelope.from;
        let stale_slot = {
            let peers = self.inner.peers.lock().await;
            match peers.get(&peer_id) {
                // The remote renegotiating over a dead connection is not a
                // duplicate; drop the husk and take the new offer.
                Some(handle) if handle.connection.connection_state().is_terminal() => true,
                Some(_) => {
                    log::debug!("duplicate offer from {peer_id} ignored");
                    return Ok(());
                }
                None => {
                    if peers.len() >= self.inner.max_direct_peers {
                        log::warn!("peer ceiling reached; dropping offer from {peer_id}");
                        return Ok(());
                    }
                    false
                }
            }
        };
        if stale_slot {
            self.teardown(&peer_id, "superseded by a new offer").await;
        }

        log::info!("answering offer from {peer_id}");
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let connection = self.inner.connector.create_connection(&self.inner.ice).await?;
        self.wire_connection(&peer_id, conn_id, &connection);

        {
            let mut peers = self.inner.peers.lock().await;
            peers.insert(
                peer_id.clone(),
                PeerHandle {
                    conn_id,
                    connection: connection.clone(),
                    channel: None,
                    phase: PeerPhase::Answering,
                    initiated_by_us: false,
                    created_at: Instant::now(),
                    last_activity: Instant::now(),
                },
            );
        }

        connection.set_remote_description(envelope.sdp).await?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer).await?;
        self.set_phase(&peer_id, PeerPhase::GatheringLocal).await;
        connection.wait_ice_gathering_complete().await?;

        let gathered = connection
            .local_description()
            .await
            .ok_or_else(|| EngineError::Config("no local description after gathering".into()))?;
        self.inner.signaling.send(&peer_id, gathered).await?;
        Ok(())
    }

    async fn on_answer(
        &self,
        envelope: SignalEnvelope,
    ) -> Result<(), EngineError> {
        let peer_id = envelope.from;
        let connection = {
            let peers = self.inner.peers.lock().await;
            match peers.get(&peer_id) {
                Some(handle)
                    if handle.connection.signaling_state() == SignalingState::HaveLocalOffer =>
                {
                    handle.connection.clone()
                }
                Some(_) => {
                    log::debug!("answer from {peer_id} in unexpected state ignored");
                    return Ok(());
                }
                None => {
                    log::debug!("answer from unknown peer {peer_id} ignored");
                    return Ok(());
                }
            }
        };
        connection.set_remote_description(envelope.sdp).await?;
        Ok(())
    }

    fn wire_connection(&self, peer_id: &str, conn_id: u64, connection: &Arc<dyn PeerConnection>) {
        let inner = self.inner.clone();
        let id = peer_id.to_string();
        connection.set_on_connection_state_change(Arc::new(move |state| {
            inner.send(PeerCommand::ConnectionState {
                peer_id: id.clone(),
                conn_id,
                state,
            });
        }));

        let inner = self.inner.clone();
        let id = peer_id.to_string();
        connection.set_on_data_channel(Arc::new(move |channel| {
            inner.send(PeerCommand::IncomingChannel {
                peer_id: id.clone(),
                conn_id,
                channel,
            });
        }));
    }

    fn wire_channel(&self, peer_id: &str, conn_id: u64, channel: &Arc<dyn DataChannel>) {
        let inner = self.inner.clone();
        let id = peer_id.to_string();
        channel.set_on_open(Arc::new(move || {
            inner.send(PeerCommand::ChannelOpen {
                peer_id: id.clone(),
                conn_id,
            });
        }));

        let inner = self.inner.clone();
        let id = peer_id.to_string();
        channel.set_on_message(Arc::new(move |data| {
            inner.send(PeerCommand::ChannelMessage {
                peer_id: id.clone(),
                conn_id,
                data: data.to_vec(),
            });
        }));

        let inner = self.inner.clone();
        let id = peer_id.to_string();
        channel.set_on_close(Arc::new(move || {
            inner.send(PeerCommand::ChannelClosed {
                peer_id: id.clone(),
                conn_id,
            });
        }));
    }

    async fn on_incoming_channel(
        &self,
        peer_id: String,
        conn_id: u64,
        channel: Arc<dyn DataChannel>,
    ) {
        if channel.label() != "data" {
            log::debug!("ignoring unexpected channel {:?}", channel.label());
            return;
        }
        if !self.is_current(&peer_id, conn_id).await {
            channel.close();
            return;
        }
        self.wire_channel(&peer_id, conn_id, &channel);
        let mut peers = self.inner.peers.lock().await;
        if let Some(handle) = peers.get_mut(&peer_id) {
            handle.channel = Some(channel);
        }
    }

    async fn on_connection_state(&self, peer_id: &str, state: PeerConnectionState) {
        log::debug!("connection to {peer_id} is now {state:?}");
        match state {
            PeerConnectionState::Connected => {
                let newly_connected = {
                    let mut peers = self.inner.peers.lock().await;
                    match peers.get_mut(peer_id) {
                        Some(handle) if handle.phase != PeerPhase::Connected => {
                            handle.phase = PeerPhase::Connected;
                            handle.last_activity = Instant::now();
                            true
                        }
                        _ => false,
                    }
                };
                if newly_connected {
                    let count = self.inner.connected_count.fetch_add(1, Ordering::SeqCst) + 1;
                    self.inner.events.emit(SessionEvent::PeerJoined {
                        peer_id: peer_id.to_string(),
                        user: None,
                    });
                    if count == 1 {
                        self.set_status(ConnectionStatus::Connected);
                    }
                }
            }
            PeerConnectionState::Failed
            | PeerConnectionState::Disconnected
            | PeerConnectionState::Closed => {
                self.teardown(peer_id, "connection reached terminal state").await;
            }
            _ => {}
        }
    }

    /// Data channel open: ship the initial sync — a delta when we know the
    /// peer's last vector, the full state otherwise.
    async fn on_channel_open(&self, peer_id: &str) {
        let known = self
            .inner
            .known_vectors
            .lock()
            .expect("known vectors")
            .get(peer_id)
            .cloned();
        let update = match &known {
            Some(vector) => match self.inner.doc.encode_delta_since(vector) {
                Ok(delta) => delta,
                Err(e) => {
                    log::warn!("delta encode for {peer_id} failed ({e}); sending full state");
                    self.inner.doc.encode_full_state()
                }
            },
            None => self.inner.doc.encode_full_state(),
        };
        log::info!(
            "initial sync to {peer_id}: {} bytes ({})",
            update.len(),
            if known.is_some() { "delta" } else { "full" }
        );
        self.send_to_peer(peer_id, FrameKind::Sync, &update).await;
    }

    async fn on_channel_message(&self, peer_id: &str, data: Vec<u8>) {
        {
            let mut peers = self.inner.peers.lock().await;
            if let Some(handle) = peers.get_mut(peer_id) {
                handle.last_activity = Instant::now();
            }
        }
        self.inner
            .message_buffer
            .lock()
            .expect("message buffer")
            .record(data.len());

        let envelope = match WireEnvelope::decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.inner.traffic.record_dropped();
                log::warn!("undecodable frame from {peer_id}: {e}");
                return;
            }
        };
        self.inner.traffic.record_received();

        match envelope {
            WireEnvelope::Sync { update } => self.apply_sync(peer_id, &update),
            WireEnvelope::SyncChunk {
                message_id,
                chunk,
                total_chunks,
                update,
            } => {
                let completed = {
                    let mut reassembly = self.inner.reassembly.lock().expect("reassembly");
                    reassembly.insert(peer_id, &message_id, chunk, total_chunks, update)
                };
                match completed {
                    Ok(Some(payload)) => {
                        self.inner.traffic.record_reassembled(total_chunks);
                        self.apply_sync(peer_id, &payload);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.inner.traffic.record_dropped();
                        log::warn!("reassembly failure from {peer_id}: {e}");
                    }
                }
            }
            WireEnvelope::Awareness { update, compressed } => {
                match self.inner.awareness.apply_remote(&update, compressed) {
                    Ok(Some(changes)) if !changes.is_empty() => {
                        let user = self.inner.awareness.with_replica(|replica| {
                            changes.all().iter().find_map(|id| {
                                replica
                                    .state_of(*id)
                                    .and_then(|s| s.get("user"))
                                    .and_then(|u| u.get("name"))
                                    .and_then(|n| n.as_str())
                                    .map(|name| crate::config::UserInfo {
                                        name: name.to_string(),
                                    })
                            })
                        });
                        self.inner.events.emit(SessionEvent::AwarenessUpdated {
                            peer_id: peer_id.to_string(),
                            user,
                        });
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => self.inner.traffic.record_dropped(),
                    Err(e) => {
                        self.inner.traffic.record_dropped();
                        log::warn!("awareness apply from {peer_id} failed: {e}");
                    }
                }
            }
        }
    }

    fn apply_sync(&self, peer_id: &str, update: &[u8]) {
        match self.inner.doc.apply_remote_update(update) {
            Ok(()) => {
                self.inner.events.emit(SessionEvent::SyncCompleted {
                    doc_id: self.inner.doc_id.clone(),
                    update_size: update.len(),
                });
            }
            Err(e) => {
                self.inner
                    .events
                    .emit_error("sync", format!("apply from {peer_id}: {e}"));
            }
        }
    }

    /// Fan a payload out over every open channel. After each successful
    /// sync send, record the document vector that peer now has.
    async fn broadcast(&self, kind: FrameKind, payload: &[u8]) {
        if matches!(kind, FrameKind::Sync)
            && payload.len() < crate::config::MIN_BROADCAST_UPDATE_SIZE
        {
            return; // empty update, nothing to say
        }
        let targets: Vec<(String, Arc<dyn DataChannel>)> = {
            let peers = self.inner.peers.lock().await;
            peers
                .iter()
                .filter_map(|(id, handle)| {
                    handle
                        .channel
                        .as_ref()
                        .filter(|ch| ch.ready_state() == crate::transport::ChannelState::Open)
                        .map(|ch| (id.clone(), ch.clone()))
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let frames = match encode_frames(&self.inner.self_id, kind, payload) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("framing failed: {e}");
                return;
            }
        };

        let vector = match kind {
            FrameKind::Sync => Some(self.inner.doc.encode_state_vector()),
            FrameKind::Awareness { .. } => None,
        };

        for (peer_id, channel) in targets {
            let mut sent = true;
            for frame in &frames {
                self.inner
                    .message_buffer
                    .lock()
                    .expect("message buffer")
                    .record(frame.len());
                if let Err(e) = channel.send(frame) {
                    log::debug!("send to {peer_id} failed: {e}");
                    sent = false;
                    break;
                }
            }
            if sent {
                self.inner.traffic.record_sent(frames.len());
                if let Some(vector) = &vector {
                    self.inner
                        .known_vectors
                        .lock()
                        .expect("known vectors")
                        .insert(peer_id.clone(), vector.clone());
                }
            }
        }
    }

    async fn send_to_peer(&self, peer_id: &str, kind: FrameKind, payload: &[u8]) {
        if matches!(kind, FrameKind::Sync)
            && payload.len() < crate::config::MIN_BROADCAST_UPDATE_SIZE
        {
            return;
        }
        let channel = {
            let peers = self.inner.peers.lock().await;
            peers.get(peer_id).and_then(|h| h.channel.clone())
        };
        let channel = match channel {
            Some(channel) => channel,
            None => return,
        };
        let frames = match encode_frames(&self.inner.self_id, kind, payload) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("framing failed: {e}");
                return;
            }
        };
        for frame in &frames {
            self.inner
                .message_buffer
                .lock()
                .expect("message buffer")
                .record(frame.len());
            if let Err(e) = channel.send(frame) {
                log::debug!("send to {peer_id} failed: {e}");
                return;
            }
        }
        self.inner.traffic.record_sent(frames.len());
        if matches!(kind, FrameKind::Sync) {
            self.inner
                .known_vectors
                .lock()
                .expect("known vectors")
                .insert(peer_id.to_string(), self.inner.doc.encode_state_vector());
        }
    }

    /// Close and forget one peer. Safe to call repeatedly.
    async fn teardown(&self, peer_id: &str, reason: &str) {
        let handle = {
            let mut peers = self.inner.peers.lock().await;
            peers.remove(peer_id)
        };
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };
        log::info!(
            "tearing down {peer_id} (as {}): {reason}",
            if handle.initiated_by_us { "initiator" } else { "responder" }
        );

        let was_connected = handle.phase == PeerPhase::Connected;
        if let Some(channel) = &handle.channel {
            channel.close();
        }
        handle.connection.close().await;

        // Best-effort: clear the departed peer's presence record so
        // discovery elsewhere stops chasing it.
        if let Err(e) = self
            .inner
            .substrate
            .remove(&self.inner.paths.peer(peer_id))
            .await
        {
            log::debug!("presence removal for {peer_id} failed: {e}");
        }

        self.inner
            .reassembly
            .lock()
            .expect("reassembly")
            .drop_peer(peer_id);

        if was_connected {
            let count = self.inner.connected_count.fetch_sub(1, Ordering::SeqCst) - 1;
            self.inner.events.emit(SessionEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            });
            if count == 0 {
                self.set_status(ConnectionStatus::Connecting);
            }
        }
    }

    async fn cleanup_tick(&self) {
        let now = Instant::now();
        let doomed: Vec<(String, &'static str)> = {
            let peers = self.inner.peers.lock().await;
            peers
                .iter()
                .filter_map(|(id, handle)| {
                    if now.duration_since(handle.last_activity) > STALE_CONNECTION_TIMEOUT {
                        Some((id.clone(), "no activity"))
                    } else if handle.phase != PeerPhase::Connected
                        && now.duration_since(handle.created_at) > IDLE_PEER_TIMEOUT
                    {
                        Some((id.clone(), "never connected"))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (peer_id, reason) in doomed {
            self.teardown(&peer_id, reason).await;
        }

        self.inner
            .reassembly
            .lock()
            .expect("reassembly")
            .prune_older_than(STALE_CONNECTION_TIMEOUT.as_millis() as i64);
        self.inner
            .message_buffer
            .lock()
            .expect("message buffer")
            .prune_expired();

        let connected: std::collections::HashSet<String> =
            self.connected_peer_ids().await.into_iter().collect();
        self.inner
            .awareness
            .prune_disconnected(&connected, &self.inner.self_id);

        self.inner.presence.cleanup_stale_peers().await;
        self.inner.last_cleanup_ms.store(epoch_ms(), Ordering::SeqCst);
    }

    async fn set_phase(&self, peer_id: &str, phase: PeerPhase) {
        let mut peers = self.inner.peers.lock().await;
        if let Some(handle) = peers.get_mut(peer_id) {
            handle.phase = phase;
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut guard = self.inner.status.lock().expect("status");
            if *guard == status {
                false
            } else {
                *guard = status;
                true
            }
        };
        if changed {
            log::info!("connection status: {}", status.as_str());
            self.inner
                .events
                .emit(SessionEvent::ConnectionStateChanged { state: status });
        }
    }
}

impl PeerInner {
    /// Queue a command for the driver; silently dropped while stopped.
    fn send(&self, command: PeerCommand) {
        self.tx.send(command);
    }
}
