//! Presence: liveness records on the substrate.
//!
//! Each live session owns exactly one record at `rooms/peers/{peerId}`,
//! kept fresh by a heartbeat and bound server-side for removal when the
//! connection drops. A scan-and-prune pass reaps records (and signal
//! inboxes) of peers that crashed hard enough to dodge the auto-remove.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::{epoch_ms, MIN_VISIBILITY_UPDATE_INTERVAL, STALE_PEER_THRESHOLD};
use crate::error::SubstrateError;
use crate::events::EventBus;
use crate::paths::DocumentPaths;
use crate::substrate::Substrate;

/// Durable peer record. Writers may add fields; readers ignore extras.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerRecord {
    pub id: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
}

impl PeerRecord {
    pub fn parse(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Whether this record is fresh enough for discovery to act on.
    pub fn is_live(&self, now_ms: i64, timeout: Duration) -> bool {
        now_ms - self.last_seen <= timeout.as_millis() as i64
    }
}

/// Publishes and maintains the local liveness record.
#[derive(Clone)]
pub struct PresenceService {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    substrate: Arc<dyn Substrate>,
    paths: DocumentPaths,
    self_id: String,
    events: EventBus,
    /// Serializes heartbeats: at most one write in flight.
    heartbeat_gate: tokio::sync::Mutex<()>,
    last_visibility_beat: Mutex<i64>,
    stale_threshold: Duration,
}

impl PresenceService {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        paths: DocumentPaths,
        self_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                substrate,
                paths,
                self_id: self_id.into(),
                events,
                heartbeat_gate: tokio::sync::Mutex::new(()),
                last_visibility_beat: Mutex::new(0),
                stale_threshold: STALE_PEER_THRESHOLD,
            }),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    /// First publication: identical to a heartbeat.
    pub async fn announce(&self) -> Result<(), SubstrateError> {
        self.heartbeat().await
    }

    /// Re-arm the disconnect binding and refresh `lastSeen`. Concurrent
    /// callers queue behind the gate rather than racing writes.
    pub async fn heartbeat(&self) -> Result<(), SubstrateError> {
        let _gate = self.inner.heartbeat_gate.lock().await;
        let path = self.inner.paths.peer(&self.inner.self_id);
        self.inner
            .substrate
            .bind_auto_remove_on_disconnect(&path)
            .await?;
        let record = PeerRecord {
            id: self.inner.self_id.clone(),
            last_seen: epoch_ms(),
        };
        self.inner
            .substrate
            .write(&path, serde_json::to_value(&record).expect("record is json"))
            .await?;
        log::trace!("heartbeat written for {}", self.inner.self_id);
        Ok(())
    }

    /// Visibility regained: force a heartbeat, but at most once per
    /// [`MIN_VISIBILITY_UPDATE_INTERVAL`].
    pub async fn on_visible(&self) -> Result<(), SubstrateError> {
        let now = epoch_ms();
        {
            let mut last = self.inner.last_visibility_beat.lock().expect("beat");
            if now - *last < MIN_VISIBILITY_UPDATE_INTERVAL.as_millis() as i64 {
                return Ok(());
            }
            *last = now;
        }
        self.heartbeat().await
    }

    /// Remove the local record. Idempotent; failures are swallowed because
    /// the disconnect binding covers us anyway.
    pub async fn stop(&self) {
        let path = self.inner.paths.peer(&self.inner.self_id);
        if let Err(e) = self.inner.substrate.remove(&path).await {
            log::debug!("presence stop ignored: {e}");
        }
    }

    /// Reap peers whose `lastSeen` predates the stale threshold, together
    /// with their signal inboxes. Errors are logged, never raised.
    pub async fn cleanup_stale_peers(&self) -> usize {
        let cutoff = epoch_ms() - self.inner.stale_threshold.as_millis() as i64;
        let stale = match self
            .inner
            .substrate
            .query_children_at_most(&self.inner.paths.peers(), "lastSeen", cutoff)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                self.inner.events.emit_error("presence-gc", e.to_string());
                return 0;
            }
        };

        let doomed: Vec<String> = stale
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| *key != self.inner.self_id)
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        log::info!("reaping {} stale peer record(s)", doomed.len());
        let mut paths = Vec::with_capacity(doomed.len() * 2);
        for peer in &doomed {
            paths.push(self.inner.paths.peer(peer));
            paths.push(self.inner.paths.signal_inbox(peer));
        }
        let removals = paths.into_iter().map(|path| {
            let substrate = self.inner.substrate.clone();
            async move { substrate.remove(&path).await }
        });
        for result in join_all(removals).await {
            if let Err(e) = result {
                log::warn!("stale peer removal failed: {e}");
            }
        }
        doomed.len()
    }

    /// Spawn the fixed-interval heartbeat loop.
    pub fn spawn_heartbeat_loop(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = service.heartbeat().await {
                    service.inner.events.emit_error("presence", e.to_string());
                }
            }
        })
    }
}
