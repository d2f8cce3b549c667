//! The document replica: a thin capability layer over a Yrs document.
//!
//! The rest of the engine only ever needs six things from the CRDT —
//! full-state encode, state-vector encode, delta-since, apply-with-origin,
//! multi-update merge, and an update subscription that can tell local edits
//! from remote ones. Everything here is synchronous; transactions are
//! serialized behind an internal gate so embedder edits, remote applies,
//! and snapshot reads can come from different tasks.

use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, Origin, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update};

use crate::error::EngineError;

/// Origin tag attached to updates applied on behalf of remote peers.
/// The update pipeline drops these so they never echo back to the mesh.
const REMOTE_ORIGIN: &str = "mesh-peer";

/// Where an update came from, as seen by the update subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by a local edit.
    Local,
    /// Applied from the mesh (or the snapshot loader).
    Remote,
}

/// Yrs document plus the transaction gate.
pub struct DocumentReplica {
    doc: Doc,
    /// Serializes transactions; Yrs panics on overlapping borrows.
    txn_gate: Mutex<()>,
}

impl DocumentReplica {
    /// Create an empty replica with incremental GC enabled.
    pub fn new() -> Self {
        let mut options = Options::default();
        options.skip_gc = false;
        Self {
            doc: Doc::with_options(options),
            txn_gate: Mutex::new(()),
        }
    }

    /// Numeric client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Run a local edit inside a write transaction (no origin tag, so the
    /// update subscription reports it as [`UpdateOrigin::Local`]).
    pub fn update<R>(&self, f: impl FnOnce(&mut TransactionMut) -> R) -> R {
        let _gate = self.txn_gate.lock().expect("txn gate");
        let mut txn = self.doc.transact_mut();
        f(&mut txn)
    }

    /// Run a read-only closure against a transaction.
    pub fn read<R>(&self, f: impl FnOnce(&yrs::Transaction) -> R) -> R {
        let _gate = self.txn_gate.lock().expect("txn gate");
        let txn = self.doc.transact();
        f(&txn)
    }

    /// Full document state as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let _gate = self.txn_gate.lock().expect("txn gate");
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Compact version summary of this replica.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let _gate = self.txn_gate.lock().expect("txn gate");
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing.
    pub fn encode_delta_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| EngineError::Crdt(format!("state vector decode: {e}")))?;
        let _gate = self.txn_gate.lock().expect("txn gate");
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Apply an update received from the mesh, tagged so it will not echo.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), EngineError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| EngineError::Crdt(format!("update decode: {e}")))?;
        let _gate = self.txn_gate.lock().expect("txn gate");
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(decoded)
            .map_err(|e| EngineError::Crdt(format!("update apply: {e}")))
    }

    /// Merge several updates into one minimal update without touching the
    /// document.
    pub fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        let mut decoded = Vec::with_capacity(updates.len());
        for bytes in updates {
            decoded.push(
                Update::decode_v1(bytes)
                    .map_err(|e| EngineError::Crdt(format!("update decode: {e}")))?,
            );
        }
        Ok(Update::merge_updates(decoded).encode_v1())
    }

    /// Subscribe to every committed update with its origin classification.
    ///
    /// The subscription lives as long as the returned handle.
    pub fn on_update(
        &self,
        cb: impl Fn(Vec<u8>, UpdateOrigin) + Send + Sync + 'static,
    ) -> Result<Subscription, EngineError> {
        let remote: Origin = REMOTE_ORIGIN.into();
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = if txn.origin() == Some(&remote) {
                    UpdateOrigin::Remote
                } else {
                    UpdateOrigin::Local
                };
                cb(event.update.clone(), origin);
            })
            .map_err(|e| EngineError::Crdt(format!("update subscription: {e}")))
    }
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}
