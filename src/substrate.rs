//! The realtime key-value substrate contract.
//!
//! The engine never talks to a concrete backend; it is handed something
//! implementing [`Substrate`] — a hierarchical store with one-shot reads,
//! subtree writes, auto-id child pushes, child-level subscriptions, and a
//! server-side "remove this when I vanish" binding. Presence, signaling, and
//! snapshots are all built from these seven primitives.
//!
//! [`MemorySubstrate`] is a complete in-process implementation with the
//! semantics the engine depends on (notably: `subscribe_child_added` replays
//! existing children before delivering new ones). Integration tests and
//! embedders without a backend run on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::epoch_ms;
use crate::error::SubstrateError;

/// Handle for detaching a child subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback for `child_added`: `(child_key, child_value)`.
pub type ChildAddedFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;
/// Callback for `child_removed`: `(child_key)`.
pub type ChildRemovedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Hierarchical realtime KV store with push/subscribe semantics.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// One-shot read of the value at `path`.
    async fn read(&self, path: &str) -> Result<Option<Value>, SubstrateError>;

    /// Atomic set of the subtree at `path`. Writing `null` removes it.
    async fn write(&self, path: &str, value: Value) -> Result<(), SubstrateError>;

    /// Remove the subtree at `path`. Removing an absent path is a no-op.
    async fn remove(&self, path: &str) -> Result<(), SubstrateError>;

    /// Create a child of `path` with a fresh auto-id key; returns the key.
    /// Keys sort in creation order.
    async fn push_child(&self, path: &str, value: Value) -> Result<String, SubstrateError>;

    /// Subscribe to children appearing under `path`.
    ///
    /// Children that already exist are delivered (in key order) before this
    /// call returns, then new children as they are written.
    async fn subscribe_child_added(
        &self,
        path: &str,
        cb: ChildAddedFn,
    ) -> Result<SubscriptionId, SubstrateError>;

    /// Subscribe to children disappearing from under `path`.
    async fn subscribe_child_removed(
        &self,
        path: &str,
        cb: ChildRemovedFn,
    ) -> Result<SubscriptionId, SubstrateError>;

    /// Detach a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);

    /// Ask the server to remove `path` when this client's connection drops.
    async fn bind_auto_remove_on_disconnect(&self, path: &str) -> Result<(), SubstrateError>;

    /// Sentinel value the server resolves to its own clock on write.
    fn server_timestamp(&self) -> Value {
        json!({ ".sv": "timestamp" })
    }

    /// Direct children of `path` whose field `child_key` is a number
    /// `<= max`. Returns `(key, value)` pairs.
    async fn query_children_at_most(
        &self,
        path: &str,
        child_key: &str,
        max: i64,
    ) -> Result<Vec<(String, Value)>, SubstrateError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory implementation
// ───────────────────────────────────────────────────────────────────

enum SubKind {
    Added(ChildAddedFn),
    Removed(ChildRemovedFn),
}

struct Sub {
    path: String,
    kind: SubKind,
}

/// In-process [`Substrate`] backed by a flat map of leaf records.
///
/// Values live at exact paths; the children of `p` are the entries keyed
/// `p/{name}`. Server timestamps resolve at write time. Cloning shares the
/// store, so every participant in a test holds the same substrate.
#[derive(Clone, Default)]
pub struct MemorySubstrate {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    nodes: Mutex<BTreeMap<String, Value>>,
    subs: Mutex<HashMap<u64, Sub>>,
    next_sub: AtomicU64,
    next_push: AtomicU64,
    disconnect_bindings: Mutex<HashSet<String>>,
}

fn parent_and_name(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

/// Replace every `{".sv": "timestamp"}` sentinel in `value` with the clock.
fn resolve_server_timestamps(value: &mut Value, now: i64) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.get(".sv").and_then(Value::as_str) == Some("timestamp") {
                *value = json!(now);
                return;
            }
            for v in map.values_mut() {
                resolve_server_timestamps(v, now);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_server_timestamps(v, now);
            }
        }
        _ => {}
    }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate this client's connection dropping: every path bound with
    /// `bind_auto_remove_on_disconnect` is removed server-side.
    pub async fn simulate_disconnect(&self) {
        let bound: Vec<String> = {
            let mut guard = self.inner.disconnect_bindings.lock().expect("bindings");
            guard.drain().collect()
        };
        for path in bound {
            let _ = self.remove(&path).await;
        }
    }

    /// Number of stored records. Test observability.
    pub fn record_count(&self) -> usize {
        self.inner.nodes.lock().expect("nodes").len()
    }

    /// Number of live subscriptions. Test observability.
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.lock().expect("subs").len()
    }

    fn added_subs_for(&self, parent: &str) -> Vec<ChildAddedFn> {
        let subs = self.inner.subs.lock().expect("subs");
        subs.values()
            .filter_map(|s| match (&s.kind, s.path == parent) {
                (SubKind::Added(cb), true) => Some(cb.clone()),
                _ => None,
            })
            .collect()
    }

    fn removed_subs_for(&self, parent: &str) -> Vec<ChildRemovedFn> {
        let subs = self.inner.subs.lock().expect("subs");
        subs.values()
            .filter_map(|s| match (&s.kind, s.path == parent) {
                (SubKind::Removed(cb), true) => Some(cb.clone()),
                _ => None,
            })
            .collect()
    }

    fn set_value(&self, path: &str, mut value: Value) {
        resolve_server_timestamps(&mut value, epoch_ms());

        let is_new = {
            let mut nodes = self.inner.nodes.lock().expect("nodes");
            nodes.insert(path.to_string(), value.clone()).is_none()
        };

        if is_new {
            if let Some((parent, name)) = parent_and_name(path) {
                for cb in self.added_subs_for(parent) {
                    cb(name, &value);
                }
            }
        }
    }

    fn remove_subtree(&self, path: &str) {
        let prefix = format!("{path}/");
        let removed: Vec<String> = {
            let mut nodes = self.inner.nodes.lock().expect("nodes");
            let keys: Vec<String> = nodes
                .keys()
                .filter(|k| *k == path || k.starts_with(&prefix))
                .cloned()
                .collect();
            for k in &keys {
                nodes.remove(k);
            }
            keys
        };

        for key in removed {
            if let Some((parent, name)) = parent_and_name(&key) {
                for cb in self.removed_subs_for(parent) {
                    cb(name);
                }
            }
        }
    }

    fn direct_children(&self, path: &str) -> Vec<(String, Value)> {
        let prefix = format!("{path}/");
        let nodes = self.inner.nodes.lock().expect("nodes");
        nodes
            .iter()
            .filter_map(|(k, v)| {
                let name = k.strip_prefix(&prefix)?;
                if name.contains('/') {
                    None
                } else {
                    Some((name.to_string(), v.clone()))
                }
            })
            .collect()
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn read(&self, path: &str) -> Result<Option<Value>, SubstrateError> {
        let nodes = self.inner.nodes.lock().expect("nodes");
        Ok(nodes.get(path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), SubstrateError> {
        if value.is_null() {
            self.remove_subtree(path);
        } else {
            self.set_value(path, value);
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), SubstrateError> {
        self.remove_subtree(path);
        Ok(())
    }

    async fn push_child(&self, path: &str, value: Value) -> Result<String, SubstrateError> {
        let n = self.inner.next_push.fetch_add(1, Ordering::SeqCst);
        let key = format!("k{n:016}");
        self.set_value(&format!("{path}/{key}"), value);
        Ok(key)
    }

    async fn subscribe_child_added(
        &self,
        path: &str,
        cb: ChildAddedFn,
    ) -> Result<SubscriptionId, SubstrateError> {
        // Replay current children first, matching realtime-database semantics.
        for (name, value) in self.direct_children(path) {
            cb(&name, &value);
        }
        let id = self.inner.next_sub.fetch_add(1, Ordering::SeqCst);
        self.inner.subs.lock().expect("subs").insert(
            id,
            Sub {
                path: path.to_string(),
                kind: SubKind::Added(cb),
            },
        );
        Ok(SubscriptionId(id))
    }

    async fn subscribe_child_removed(
        &self,
        path: &str,
        cb: ChildRemovedFn,
    ) -> Result<SubscriptionId, SubstrateError> {
        let id = self.inner.next_sub.fetch_add(1, Ordering::SeqCst);
        self.inner.subs.lock().expect("subs").insert(
            id,
            Sub {
                path: path.to_string(),
                kind: SubKind::Removed(cb),
            },
        );
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subs.lock().expect("subs").remove(&id.0);
    }

    async fn bind_auto_remove_on_disconnect(&self, path: &str) -> Result<(), SubstrateError> {
        self.inner
            .disconnect_bindings
            .lock()
            .expect("bindings")
            .insert(path.to_string());
        Ok(())
    }

    async fn query_children_at_most(
        &self,
        path: &str,
        child_key: &str,
        max: i64,
    ) -> Result<Vec<(String, Value)>, SubstrateError> {
        Ok(self
            .direct_children(path)
            .into_iter()
            .filter(|(_, v)| {
                v.get(child_key)
                    .and_then(Value::as_i64)
                    .map(|n| n <= max)
                    .unwrap_or(false)
            })
            .collect())
    }
}
