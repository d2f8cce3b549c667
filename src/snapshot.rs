//! Durable snapshot persistence on the substrate.
//!
//! The write path is change-driven and cheap to arm: every CRDT update
//! schedules a debounced flush, and the flush compares state vectors by
//! byte equality before doing any work. A full-state re-encode is
//! O(document); the vector compare is O(peers) — so a session that idles
//! writes nothing, no matter how large the document is.
//!
//! Record shape at `snapshots/latest` (and `snapshots/{label}_{ts}`):
//!
//! ```text
//! { update: base64, stateVector: base64, updatedAt: <server-ts>,
//!   version: number, checksum: sha256-hex }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::config::{epoch_ms, PERSISTENCE_DEBOUNCE};
use crate::document::DocumentReplica;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::paths::DocumentPaths;
use crate::substrate::Substrate;

/// Durable snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub update: String,
    pub state_vector: String,
    pub updated_at: Value,
    pub version: u64,
    pub checksum: String,
}

/// Lowercase hex SHA-256 over the raw full-state bytes.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct SnapState {
    /// State vector at the last successful write; the dirtiness gate.
    last_vector: Option<Vec<u8>>,
    /// Version stamped into the next successful write.
    version: u64,
}

/// Load-on-start, debounced change-driven writes, explicit force path.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<SnapInner>,
}

struct SnapInner {
    substrate: Arc<dyn Substrate>,
    paths: DocumentPaths,
    doc: Arc<DocumentReplica>,
    doc_id: String,
    events: EventBus,
    state: Mutex<SnapState>,
    /// Serializes flushes so the debounce, the backstop, and explicit
    /// forces never interleave a write or double-stamp a version.
    flush_gate: tokio::sync::Mutex<()>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    debounce_window: Duration,
}

impl SnapshotStore {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        paths: DocumentPaths,
        doc: Arc<DocumentReplica>,
        doc_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self::with_debounce(substrate, paths, doc, doc_id, events, PERSISTENCE_DEBOUNCE)
    }

    pub fn with_debounce(
        substrate: Arc<dyn Substrate>,
        paths: DocumentPaths,
        doc: Arc<DocumentReplica>,
        doc_id: impl Into<String>,
        events: EventBus,
        debounce_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SnapInner {
                substrate,
                paths,
                doc,
                doc_id: doc_id.into(),
                events,
                state: Mutex::new(SnapState {
                    last_vector: None,
                    version: 0,
                }),
                flush_gate: tokio::sync::Mutex::new(()),
                debounce: Mutex::new(None),
                debounce_window,
            }),
        }
    }

    /// Read the latest persisted full state, falling back to the legacy
    /// `documents` record. `None` when nothing was ever persisted.
    pub async fn load(&self) -> Result<Option<Vec<u8>>, EngineError> {
        if let Some(value) = self
            .inner
            .substrate
            .read(&self.inner.paths.latest_snapshot())
            .await?
        {
            let record: SnapshotRecord = serde_json::from_value(value)
                .map_err(|e| EngineError::Snapshot(format!("snapshot record: {e}")))?;
            let bytes = BASE64
                .decode(&record.update)
                .map_err(|e| EngineError::Snapshot(format!("snapshot base64: {e}")))?;
            if checksum_hex(&bytes) != record.checksum {
                return Err(EngineError::Snapshot(format!(
                    "checksum mismatch for version {}",
                    record.version
                )));
            }
            log::debug!(
                "loaded snapshot version {} ({} bytes)",
                record.version,
                bytes.len()
            );
            return Ok(Some(bytes));
        }

        // Legacy flat record: { update: base64 }. Read-only compatibility.
        if let Some(value) = self.inner.substrate.read(self.inner.paths.documents()).await? {
            if let Some(encoded) = value.get("update").and_then(Value::as_str) {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| EngineError::Snapshot(format!("legacy base64: {e}")))?;
                log::debug!("loaded legacy document record ({} bytes)", bytes.len());
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Record that the document now matches what is persisted (after the
    /// startup load applies), so the first flush is gated correctly.
    pub fn mark_clean(&self) {
        let mut state = self.inner.state.lock().expect("snap state");
        state.last_vector = Some(self.inner.doc.encode_state_vector());
    }

    /// Change-driven entry point: (re)arm the debounced flush.
    pub fn schedule_flush(&self) {
        let mut debounce = self.inner.debounce.lock().expect("debounce");
        if let Some(handle) = debounce.take() {
            handle.abort();
        }
        let inner = self.inner.clone();
        let window = self.inner.debounce_window;
        *debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let store = SnapshotStore { inner };
            if let Err(e) = store.flush(false).await {
                store.inner.events.emit_error("persistence", e.to_string());
            }
        }));
    }

    /// Write a snapshot if the document moved since the last write.
    /// `force` writes unconditionally. Returns the version written.
    pub async fn flush(&self, force: bool) -> Result<Option<u64>, EngineError> {
        let _gate = self.inner.flush_gate.lock().await;
        let current_vector = self.inner.doc.encode_state_vector();
        {
            let state = self.inner.state.lock().expect("snap state");
            if !force && state.last_vector.as_deref() == Some(current_vector.as_slice()) {
                return Ok(None);
            }
        }

        let full_state = self.inner.doc.encode_full_state();
        let version = self.inner.state.lock().expect("snap state").version;
        let record = self.build_record(&full_state, &current_vector, version);

        self.inner
            .substrate
            .write(
                &self.inner.paths.latest_snapshot(),
                serde_json::to_value(&record)
                    .map_err(|e| EngineError::Snapshot(e.to_string()))?,
            )
            .await?;

        {
            let mut state = self.inner.state.lock().expect("snap state");
            state.last_vector = Some(current_vector);
            state.version = version + 1;
        }
        log::debug!(
            "persisted snapshot version {version} ({} bytes)",
            full_state.len()
        );
        self.inner.events.emit(SessionEvent::DocumentPersisted {
            doc_id: self.inner.doc_id.clone(),
            version,
        });
        Ok(Some(version))
    }

    /// Write a labeled snapshot at `snapshots/{label}_{ts}`. Does not touch
    /// the dirtiness gate or the version counter.
    pub async fn write_labeled(&self, label: &str) -> Result<String, EngineError> {
        let full_state = self.inner.doc.encode_full_state();
        let vector = self.inner.doc.encode_state_vector();
        let version = self.inner.state.lock().expect("snap state").version;
        let record = self.build_record(&full_state, &vector, version);
        let path = self.inner.paths.labeled_snapshot(label, epoch_ms());
        self.inner
            .substrate
            .write(
                &path,
                serde_json::to_value(&record)
                    .map_err(|e| EngineError::Snapshot(e.to_string()))?,
            )
            .await?;
        Ok(path)
    }

    fn build_record(&self, full_state: &[u8], vector: &[u8], version: u64) -> SnapshotRecord {
        SnapshotRecord {
            update: BASE64.encode(full_state),
            state_vector: BASE64.encode(vector),
            updated_at: self.inner.substrate.server_timestamp(),
            version,
            checksum: checksum_hex(full_state),
        }
    }

    /// Spawn the backstop loop: the same gated flush on a fixed interval,
    /// catching anything the debounce path lost to a transient write error.
    pub fn spawn_backstop(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush(false).await {
                    store.inner.events.emit_error("persistence", e.to_string());
                }
            }
        })
    }

    /// Abort the pending debounced flush.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.debounce.lock().expect("debounce").take() {
            handle.abort();
        }
    }
}
