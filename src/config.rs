//! Session configuration and engine tunables.
//!
//! All durations and ceilings the engine uses live here, with the defaults
//! the rest of the crate assumes. Everything on [`SessionConfig`] has a
//! default except `doc_id`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::paths::PathConfig;

/// Ceiling for a single data-channel frame, including envelope overhead.
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;
/// Bytes reserved inside `MAX_CHUNK_SIZE` for chunk bookkeeping fields.
pub const CHUNK_HEADER_SIZE: usize = 256;
/// Debounce window for coalescing local awareness changes.
pub const AWARENESS_THROTTLE: Duration = Duration::from_millis(80);
/// Payloads below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 256;
/// Interval between presence heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Interval between memory-governance ticks.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Peer records with `lastSeen` older than this are reaped by the GC.
pub const STALE_PEER_THRESHOLD: Duration = Duration::from_secs(10 * 60);
/// Peer records with `lastSeen` older than this are ignored by discovery.
pub const PEER_PRESENCE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// In-memory connections idle longer than this are torn down.
pub const STALE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Connections that never reached `connected` are closed after this age.
pub const IDLE_PEER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Minimum gap between visibility-triggered heartbeats.
pub const MIN_VISIBILITY_UPDATE_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Hard cap on tracked awareness states.
pub const MAX_AWARENESS_STATES: usize = 50;
/// Message-buffer byte ceiling.
pub const MAX_MEMORY_BUFFER_BYTES: usize = 10 * 1024 * 1024;
/// Message-buffer entry ceiling.
pub const MAX_MEMORY_BUFFER_ENTRIES: usize = 1_000;
/// Message-buffer entry retention.
pub const MESSAGE_BUFFER_RETENTION: Duration = Duration::from_secs(60 * 60);
/// Batching window for local CRDT updates.
pub const UPDATE_BATCH_WINDOW: Duration = Duration::from_millis(50);
/// Debounce for change-driven snapshot writes.
pub const PERSISTENCE_DEBOUNCE: Duration = Duration::from_millis(2_000);
/// Default backstop interval for the snapshot loop.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(15_000);
/// Default ceiling on simultaneous direct peer connections.
pub const DEFAULT_MAX_DIRECT_PEERS: usize = 20;
/// Outbound updates smaller than this are no-ops and are not broadcast.
pub const MIN_BROADCAST_UPDATE_SIZE: usize = 3;

/// Default STUN servers used when the embedder supplies none.
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Display metadata for the local participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
}

/// Options for [`crate::session::Session`] construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Logical document id. Required.
    pub doc_id: String,
    /// Stable id of this participant. Defaults to a fresh random id.
    pub peer_id: String,
    /// Display info for this participant.
    pub user: UserInfo,
    /// Backstop interval for the snapshot loop.
    pub sync_interval: Duration,
    /// Ceiling on simultaneous direct peer connections.
    pub max_direct_peers: usize,
    /// Substrate path layout.
    pub path_config: PathConfig,
    /// STUN server URLs handed to the transport.
    pub stun_urls: Vec<String>,
}

impl SessionConfig {
    /// Build a config for `doc_id` with defaults for everything else.
    pub fn new(doc_id: impl Into<String>) -> Self {
        let peer_id = Uuid::new_v4().to_string();
        let user = UserInfo {
            name: default_user_name(&peer_id),
        };
        Self {
            doc_id: doc_id.into(),
            peer_id,
            user,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_direct_peers: DEFAULT_MAX_DIRECT_PEERS,
            path_config: PathConfig::default(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Override the peer id, refreshing the default user name if it was
    /// derived from the old id.
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        let derived = default_user_name(&self.peer_id);
        self.peer_id = peer_id.into();
        if self.user.name == derived {
            self.user.name = default_user_name(&self.peer_id);
        }
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user.name = name.into();
        self
    }

    pub fn with_path_config(mut self, paths: PathConfig) -> Self {
        self.path_config = paths;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_max_direct_peers(mut self, max: usize) -> Self {
        self.max_direct_peers = max;
        self
    }
}

fn default_user_name(peer_id: &str) -> String {
    let short: String = peer_id.chars().take(6).collect();
    format!("User-{short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::new("doc-1");
        assert_eq!(cfg.doc_id, "doc-1");
        assert_eq!(cfg.sync_interval, Duration::from_millis(15_000));
        assert_eq!(cfg.max_direct_peers, 20);
        assert_eq!(cfg.stun_urls.len(), 2);
        assert!(cfg.user.name.starts_with("User-"));
    }

    #[test]
    fn test_user_name_follows_peer_id() {
        let cfg = SessionConfig::new("doc").with_peer_id("abcdef123456");
        assert_eq!(cfg.user.name, "User-abcdef");

        let cfg = SessionConfig::new("doc")
            .with_user_name("Ada")
            .with_peer_id("abcdef123456");
        assert_eq!(cfg.user.name, "Ada");
    }

    #[test]
    fn test_epoch_ms_monotonic_enough() {
        let a = epoch_ms();
        let b = epoch_ms();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000); // sometime after 2017
    }
}
