//! # meshdoc — peer-to-peer collaborative document engine
//!
//! Real-time collaborative editing for CRDT documents, multiplexed across
//! three transports:
//!
//! ```text
//! ┌──────────┐   data channels (mesh)   ┌──────────┐
//! │ Session  │ ◄──────────────────────► │ Session  │
//! │ (peer A) │                          │ (peer B) │
//! └────┬─────┘                          └────┬─────┘
//!      │        realtime KV substrate        │
//!      └──────► discovery / signaling ◄──────┘
//!                    snapshots
//! ```
//!
//! - A **peer-to-peer mesh** of ordered data channels carries document
//!   updates and awareness (cursor/presence) state with low latency.
//! - A **substrate** — any hierarchical realtime KV store implementing
//!   [`substrate::Substrate`] — carries peer discovery, offer/answer
//!   signaling, and durable snapshots. Nothing document-shaped flows
//!   through it in steady state.
//! - The **CRDT** ([`yrs`]) is the sole arbiter of concurrent edits.
//!
//! ## Modules
//!
//! - [`session`] — the composition root; start here
//! - [`substrate`] / [`transport`] — the injected external contracts, with
//!   complete in-memory implementations for tests and embedding
//! - [`document`] / [`awareness`] — the replicas
//! - [`peer`] — discovery, deterministic negotiation, fan-out, teardown
//! - [`framing`] — wire envelopes, chunking, reassembly
//! - [`snapshot`] / [`presence`] / [`signaling`] — substrate protocols
//! - [`update`] / [`codec`] / [`paths`] / [`config`] — supporting pieces

pub mod awareness;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod framing;
pub mod paths;
pub mod peer;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod snapshot;
pub mod substrate;
pub mod transport;
pub mod update;

pub use awareness::{AwarenessChanges, AwarenessPipeline, AwarenessReplica};
pub use codec::CompressionCodec;
pub use config::{SessionConfig, UserInfo};
pub use document::{DocumentReplica, UpdateOrigin};
pub use error::{EngineError, FramingError, SubstrateError, TransportError};
pub use framing::{TrafficCounters, TrafficStats, WireEnvelope};
pub use events::{ConnectionStatus, EventBus, ListenerId, SessionEvent};
pub use paths::{DocumentPaths, PathConfig};
pub use peer::{PeerManager, PeerMemoryStats};
pub use presence::{PeerRecord, PresenceService};
pub use session::{MemoryStats, Session};
pub use signaling::{SignalEnvelope, SignalingChannel};
pub use snapshot::{SnapshotRecord, SnapshotStore};
pub use substrate::{MemorySubstrate, Substrate};
pub use transport::{
    DataChannel, IceConfig, MemoryRtc, PeerConnection, PeerConnectionState, PeerConnector,
    SessionDescription,
};
pub use update::UpdatePipeline;
