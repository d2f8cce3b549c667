//! Substrate path resolution.
//!
//! A session touches four locations on the substrate:
//!
//! ```text
//! snapshots/latest          — current durable snapshot
//! snapshots/{label}_{ts}    — labeled snapshots
//! documents                 — legacy load-only record
//! rooms/peers/{peerId}      — ephemeral presence record
//! signaling/{peerId}/{id}   — per-peer signal inbox
//! ```
//!
//! The embedder either supplies the four roots verbatim (flat layout) or a
//! base path that gets `/{docId}/{name}` appended (nested layout).

use crate::error::EngineError;

/// How the four substrate roots are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathConfig {
    /// Four absolute paths supplied verbatim.
    Flat {
        documents: String,
        rooms: String,
        snapshots: String,
        signaling: String,
    },
    /// A base path joined with the document id, then the four sub-names.
    Nested { base_path: String },
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig::Flat {
            documents: "documents".into(),
            rooms: "rooms".into(),
            snapshots: "snapshots".into(),
            signaling: "signaling".into(),
        }
    }
}

/// Resolved absolute paths for one document session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPaths {
    documents: String,
    rooms: String,
    snapshots: String,
    signaling: String,
}

impl DocumentPaths {
    /// Resolve a layout for `doc_id`.
    ///
    /// Fails when a flat layout has an empty root, since an empty path would
    /// silently alias the substrate root.
    pub fn resolve(config: &PathConfig, doc_id: &str) -> Result<Self, EngineError> {
        match config {
            PathConfig::Flat {
                documents,
                rooms,
                snapshots,
                signaling,
            } => {
                for (name, value) in [
                    ("documents", documents),
                    ("rooms", rooms),
                    ("snapshots", snapshots),
                    ("signaling", signaling),
                ] {
                    if value.is_empty() {
                        return Err(EngineError::Config(format!(
                            "flat path layout requires a non-empty `{name}` path"
                        )));
                    }
                }
                Ok(Self {
                    documents: documents.clone(),
                    rooms: rooms.clone(),
                    snapshots: snapshots.clone(),
                    signaling: signaling.clone(),
                })
            }
            PathConfig::Nested { base_path } => {
                if base_path.is_empty() {
                    return Err(EngineError::Config(
                        "nested path layout requires a non-empty `basePath`".into(),
                    ));
                }
                let root = format!("{}/{}", base_path.trim_end_matches('/'), doc_id);
                Ok(Self {
                    documents: format!("{root}/documents"),
                    rooms: format!("{root}/rooms"),
                    snapshots: format!("{root}/snapshots"),
                    signaling: format!("{root}/signaling"),
                })
            }
        }
    }

    /// Legacy load-only document record.
    pub fn documents(&self) -> &str {
        &self.documents
    }

    /// Presence collection root (`…/peers` children).
    pub fn peers(&self) -> String {
        format!("{}/peers", self.rooms)
    }

    /// Presence record for one peer.
    pub fn peer(&self, peer_id: &str) -> String {
        format!("{}/peers/{}", self.rooms, peer_id)
    }

    /// Current snapshot record.
    pub fn latest_snapshot(&self) -> String {
        format!("{}/latest", self.snapshots)
    }

    /// Labeled snapshot record.
    pub fn labeled_snapshot(&self, label: &str, ts: i64) -> String {
        format!("{}/{}_{}", self.snapshots, label, ts)
    }

    /// Signal inbox root for one peer.
    pub fn signal_inbox(&self, peer_id: &str) -> String {
        format!("{}/{}", self.signaling, peer_id)
    }

    /// One envelope inside a peer's signal inbox.
    pub fn signal_entry(&self, peer_id: &str, child: &str) -> String {
        format!("{}/{}/{}", self.signaling, peer_id, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_layout() {
        let paths = DocumentPaths::resolve(&PathConfig::default(), "doc-1").unwrap();
        assert_eq!(paths.documents(), "documents");
        assert_eq!(paths.peers(), "rooms/peers");
        assert_eq!(paths.peer("p1"), "rooms/peers/p1");
        assert_eq!(paths.latest_snapshot(), "snapshots/latest");
        assert_eq!(paths.signal_inbox("p2"), "signaling/p2");
        assert_eq!(paths.signal_entry("p2", "k1"), "signaling/p2/k1");
    }

    #[test]
    fn test_nested_layout() {
        let cfg = PathConfig::Nested {
            base_path: "workspaces/acme/".into(),
        };
        let paths = DocumentPaths::resolve(&cfg, "doc-1").unwrap();
        assert_eq!(paths.documents(), "workspaces/acme/doc-1/documents");
        assert_eq!(paths.peers(), "workspaces/acme/doc-1/rooms/peers");
        assert_eq!(
            paths.latest_snapshot(),
            "workspaces/acme/doc-1/snapshots/latest"
        );
    }

    #[test]
    fn test_labeled_snapshot_path() {
        let paths = DocumentPaths::resolve(&PathConfig::default(), "d").unwrap();
        assert_eq!(
            paths.labeled_snapshot("backup", 1_700_000_000_000),
            "snapshots/backup_1700000000000"
        );
    }

    #[test]
    fn test_missing_config_rejected() {
        let cfg = PathConfig::Flat {
            documents: "".into(),
            rooms: "rooms".into(),
            snapshots: "snapshots".into(),
            signaling: "signaling".into(),
        };
        let err = DocumentPaths::resolve(&cfg, "d").unwrap_err();
        assert!(err.to_string().contains("documents"));

        let cfg = PathConfig::Nested {
            base_path: "".into(),
        };
        assert!(DocumentPaths::resolve(&cfg, "d").is_err());
    }
}
