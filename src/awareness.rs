//! Awareness: ephemeral per-client presence state (cursors, selections,
//! user info) replicated alongside the document.
//!
//! ```text
//! local set_local_field()
//!       │
//!       ▼
//! AwarenessReplica (client-id → clocked state)
//!       │  changed ids
//!       ▼
//! AwarenessPipeline — union of pending ids, flushed on a throttle
//!       │  encode once, gzip if large
//!       ▼
//! broadcast capability (peer manager fan-out)
//! ```
//!
//! Remote updates run the same path in reverse, gated by a hard cardinality
//! ceiling so a misbehaving mesh cannot grow the map without bound.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::codec::CompressionCodec;
use crate::config::{AWARENESS_THROTTLE, MAX_AWARENESS_STATES};
use crate::error::{EngineError, FramingError};

/// Client-id sets touched by one replica mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Union of all touched client ids.
    pub fn all(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// One client's slot: a clock and an optional JSON state. `None` is a
/// tombstone that keeps the clock so late updates cannot resurrect it.
#[derive(Debug, Clone)]
struct Slot {
    clock: u32,
    state: Option<Value>,
}

/// Wire form of one client entry (state carried as JSON text because the
/// envelope is a non-self-describing encoding).
#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    client_id: u64,
    clock: u32,
    state: Option<String>,
}

/// Mapping from client id to presence state, with per-client clocks.
pub struct AwarenessReplica {
    local_client_id: u64,
    slots: HashMap<u64, Slot>,
}

impl AwarenessReplica {
    pub fn new(local_client_id: u64) -> Self {
        Self {
            local_client_id,
            slots: HashMap::new(),
        }
    }

    pub fn local_client_id(&self) -> u64 {
        self.local_client_id
    }

    /// Number of clients with live (non-tombstone) state.
    pub fn cardinality(&self) -> usize {
        self.slots.values().filter(|s| s.state.is_some()).count()
    }

    pub fn state_of(&self, client_id: u64) -> Option<&Value> {
        self.slots.get(&client_id).and_then(|s| s.state.as_ref())
    }

    /// Live states, including the local one.
    pub fn states(&self) -> impl Iterator<Item = (u64, &Value)> {
        self.slots
            .iter()
            .filter_map(|(id, s)| s.state.as_ref().map(|v| (*id, v)))
    }

    /// Replace the local client's entire state.
    pub fn set_local_state(&mut self, state: Value) -> AwarenessChanges {
        let id = self.local_client_id;
        let slot = self.slots.entry(id).or_insert(Slot {
            clock: 0,
            state: None,
        });
        let was_live = slot.state.is_some();
        slot.clock += 1;
        slot.state = Some(state);
        if was_live {
            AwarenessChanges {
                updated: vec![id],
                ..Default::default()
            }
        } else {
            AwarenessChanges {
                added: vec![id],
                ..Default::default()
            }
        }
    }

    /// Merge one field into the local state object.
    pub fn set_local_field(&mut self, key: &str, value: Value) -> AwarenessChanges {
        let mut state = self
            .slots
            .get(&self.local_client_id)
            .and_then(|s| s.state.clone())
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(map) = &mut state {
            map.insert(key.to_string(), value);
        }
        self.set_local_state(state)
    }

    /// Encode the named clients' slots into an opaque update.
    pub fn encode_update(&self, client_ids: &[u64]) -> Result<Vec<u8>, FramingError> {
        let entries: Vec<WireEntry> = client_ids
            .iter()
            .filter_map(|id| {
                self.slots.get(id).map(|slot| WireEntry {
                    client_id: *id,
                    clock: slot.clock,
                    state: slot.state.as_ref().map(|v| v.to_string()),
                })
            })
            .collect();
        bincode::serde::encode_to_vec(&entries, bincode::config::standard())
            .map_err(|e| FramingError::SerializationError(e.to_string()))
    }

    /// Apply a remote update; per-client clocks make this idempotent and
    /// order-tolerant.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<AwarenessChanges, FramingError> {
        let (entries, _): (Vec<WireEntry>, usize) =
            bincode::serde::decode_from_slice(update, bincode::config::standard())
                .map_err(|e| FramingError::DeserializationError(e.to_string()))?;

        let mut changes = AwarenessChanges::default();
        for entry in entries {
            let state = match entry.state.as_deref() {
                Some(text) => Some(
                    serde_json::from_str::<Value>(text)
                        .map_err(|e| FramingError::DeserializationError(e.to_string()))?,
                ),
                None => None,
            };

            match self.slots.get_mut(&entry.client_id) {
                Some(slot) => {
                    if entry.clock <= slot.clock {
                        continue;
                    }
                    let was_live = slot.state.is_some();
                    let is_live = state.is_some();
                    slot.clock = entry.clock;
                    slot.state = state;
                    match (was_live, is_live) {
                        (false, true) => changes.added.push(entry.client_id),
                        (true, true) => changes.updated.push(entry.client_id),
                        (true, false) => changes.removed.push(entry.client_id),
                        (false, false) => {}
                    }
                }
                None => {
                    let live = state.is_some();
                    self.slots.insert(
                        entry.client_id,
                        Slot {
                            clock: entry.clock,
                            state,
                        },
                    );
                    if live {
                        changes.added.push(entry.client_id);
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Tombstone the given clients (clock bump + state cleared).
    pub fn remove_states(&mut self, client_ids: &[u64]) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();
        for id in client_ids {
            if let Some(slot) = self.slots.get_mut(id) {
                if slot.state.is_some() {
                    slot.clock += 1;
                    slot.state = None;
                    changes.removed.push(*id);
                }
            }
        }
        changes
    }

    /// Drop every slot the predicate rejects (local client always kept).
    /// Returns the ids removed.
    pub fn retain(&mut self, keep: impl Fn(u64, &Value) -> bool) -> Vec<u64> {
        let local = self.local_client_id;
        let doomed: Vec<u64> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| match &slot.state {
                Some(state) if *id != local && !keep(*id, state) => Some(*id),
                _ => None,
            })
            .collect();
        for id in &doomed {
            self.slots.remove(id);
        }
        doomed
    }
}

// ───────────────────────────────────────────────────────────────────
// Pipeline
// ───────────────────────────────────────────────────────────────────

/// Capability handed in by the peer manager: `(update, compressed)`.
pub type BroadcastAwarenessFn = Arc<dyn Fn(Vec<u8>, bool) + Send + Sync>;

/// Throttled local-awareness broadcaster and guarded remote applier.
#[derive(Clone)]
pub struct AwarenessPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    replica: Arc<Mutex<AwarenessReplica>>,
    codec: CompressionCodec,
    broadcast: BroadcastAwarenessFn,
    pending: Mutex<HashSet<u64>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    throttle: Duration,
}

impl AwarenessPipeline {
    pub fn new(replica: Arc<Mutex<AwarenessReplica>>, broadcast: BroadcastAwarenessFn) -> Self {
        Self::with_throttle(replica, broadcast, AWARENESS_THROTTLE)
    }

    pub fn with_throttle(
        replica: Arc<Mutex<AwarenessReplica>>,
        broadcast: BroadcastAwarenessFn,
        throttle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                replica,
                codec: CompressionCodec::default(),
                broadcast,
                pending: Mutex::new(HashSet::new()),
                timer: Mutex::new(None),
                throttle,
            }),
        }
    }

    /// Record locally-changed client ids; the flush fires once per throttle
    /// window no matter how many changes land inside it.
    pub fn notify_local_change(&self, changes: &AwarenessChanges) {
        if changes.is_empty() {
            return;
        }
        {
            let mut pending = self.inner.pending.lock().expect("pending");
            pending.extend(changes.all());
        }
        let mut timer = self.inner.timer.lock().expect("timer");
        if timer.as_ref().map(|t| t.is_finished()).unwrap_or(true) {
            let inner = self.inner.clone();
            let throttle = self.inner.throttle;
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(throttle).await;
                Self::flush_inner(&inner);
            }));
        }
    }

    /// Flush pending ids immediately (teardown, tests).
    pub fn flush_now(&self) {
        Self::flush_inner(&self.inner);
    }

    fn flush_inner(inner: &Arc<PipelineInner>) {
        let ids: Vec<u64> = {
            let mut pending = inner.pending.lock().expect("pending");
            let mut ids: Vec<u64> = pending.drain().collect();
            ids.sort_unstable();
            ids
        };
        if ids.is_empty() {
            return;
        }
        let encoded = {
            let replica = inner.replica.lock().expect("awareness replica");
            replica.encode_update(&ids)
        };
        match encoded {
            Ok(update) => {
                let (payload, compressed) = inner.codec.compress(&update);
                (inner.broadcast)(payload, compressed);
            }
            Err(e) => log::warn!("awareness encode failed: {e}"),
        }
    }

    /// Apply a remote awareness update.
    ///
    /// Updates arriving while the replica is at its cardinality ceiling are
    /// dropped whole (returned as `None`); the memory tick prunes
    /// disconnected entries instead.
    pub fn apply_remote(
        &self,
        update: &[u8],
        compressed: bool,
    ) -> Result<Option<AwarenessChanges>, EngineError> {
        let raw = if compressed {
            self.inner.codec.decompress(update)?
        } else {
            update.to_vec()
        };
        let mut replica = self.inner.replica.lock().expect("awareness replica");
        if replica.cardinality() >= MAX_AWARENESS_STATES {
            log::debug!(
                "awareness update dropped: {} states at ceiling",
                replica.cardinality()
            );
            return Ok(None);
        }
        Ok(Some(replica.apply_update(&raw)?))
    }

    /// Memory tick: above the ceiling, drop entries for clients that are
    /// neither us nor a currently connected peer. Returns how many went.
    pub fn prune_disconnected(
        &self,
        connected_peer_ids: &HashSet<String>,
        self_peer_id: &str,
    ) -> usize {
        let mut replica = self.inner.replica.lock().expect("awareness replica");
        if replica.cardinality() <= MAX_AWARENESS_STATES {
            return 0;
        }
        let doomed = replica.retain(|_, state| {
            state
                .get("peerId")
                .and_then(Value::as_str)
                .map(|peer| peer == self_peer_id || connected_peer_ids.contains(peer))
                .unwrap_or(false)
        });
        if !doomed.is_empty() {
            log::debug!("pruned {} disconnected awareness states", doomed.len());
        }
        doomed.len()
    }

    /// Read access to the underlying replica.
    pub fn with_replica<R>(&self, f: impl FnOnce(&AwarenessReplica) -> R) -> R {
        let replica = self.inner.replica.lock().expect("awareness replica");
        f(&replica)
    }

    /// Abort the pending flush timer.
    pub fn shutdown(&self) {
        if let Some(timer) = self.inner.timer.lock().expect("timer").take() {
            timer.abort();
        }
        self.inner.pending.lock().expect("pending").clear();
    }
}
