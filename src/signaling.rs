//! Signaling over the substrate: per-peer inboxes of SDP envelopes.
//!
//! `signaling/{peerId}` is an append-only inbox; each envelope is an
//! auto-id child written by the remote side and deleted by the consumer
//! once handled. Because ICE is non-trickled, a whole negotiation is just
//! two envelopes: one offer, one answer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::epoch_ms;
use crate::error::SubstrateError;
use crate::paths::DocumentPaths;
use crate::substrate::{Substrate, SubscriptionId};
use crate::transport::{SdpType, SessionDescription};

/// One signal: an offer or answer in flight between two peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: SessionDescription,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
}

impl SignalEnvelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, sdp: SessionDescription) -> Self {
        Self {
            kind: sdp.kind,
            sdp,
            from: from.into(),
            to: to.into(),
            timestamp: epoch_ms(),
        }
    }
}

/// Item surfaced by the inbox listener. Malformed children still carry
/// their key so the consumer can delete them.
#[derive(Debug)]
pub enum InboxItem {
    Envelope { key: String, envelope: SignalEnvelope },
    Malformed { key: String },
}

/// Writer/consumer for signal inboxes.
#[derive(Clone)]
pub struct SignalingChannel {
    substrate: Arc<dyn Substrate>,
    paths: DocumentPaths,
    self_id: String,
}

impl SignalingChannel {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        paths: DocumentPaths,
        self_id: impl Into<String>,
    ) -> Self {
        Self {
            substrate,
            paths,
            self_id: self_id.into(),
        }
    }

    /// Push a description into `to`'s inbox.
    pub async fn send(
        &self,
        to: &str,
        sdp: SessionDescription,
    ) -> Result<(), SubstrateError> {
        let envelope = SignalEnvelope::new(self.self_id.clone(), to, sdp);
        let value = serde_json::to_value(&envelope).expect("envelope is json");
        let inbox = self.paths.signal_inbox(to);
        let key = self.substrate.push_child(&inbox, value).await?;
        log::debug!(
            "signal {:?} {} -> {} ({key})",
            envelope.kind,
            envelope.from,
            envelope.to
        );
        Ok(())
    }

    /// Start consuming the local inbox. Envelopes (and malformed children)
    /// stream out in arrival order; callers delete each with [`Self::ack`]
    /// after handling.
    pub async fn listen(
        &self,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<InboxItem>), SubstrateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self
            .substrate
            .subscribe_child_added(
                &self.paths.signal_inbox(&self.self_id),
                Arc::new(move |key, value| {
                    let item = match serde_json::from_value::<SignalEnvelope>(value.clone()) {
                        Ok(envelope) => InboxItem::Envelope {
                            key: key.to_string(),
                            envelope,
                        },
                        Err(e) => {
                            log::warn!("malformed signal envelope {key}: {e}");
                            InboxItem::Malformed {
                                key: key.to_string(),
                            }
                        }
                    };
                    let _ = tx.send(item);
                }),
            )
            .await?;
        Ok((sub, rx))
    }

    /// Delete one handled envelope from the local inbox.
    pub async fn ack(&self, key: &str) {
        let path = self.paths.signal_entry(&self.self_id, key);
        if let Err(e) = self.substrate.remove(&path).await {
            log::debug!("signal ack failed for {key}: {e}");
        }
    }

    /// Drop the whole local inbox (teardown / burst cleanup).
    pub async fn clear_inbox(&self) {
        let inbox = self.paths.signal_inbox(&self.self_id);
        if let Err(e) = self.substrate.remove(&inbox).await {
            log::debug!("inbox clear failed: {e}");
        }
    }
}
