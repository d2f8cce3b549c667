//! Data-channel framing: JSON envelopes, chunking, and reassembly.
//!
//! Wire format (one JSON document per data-channel message):
//!
//! ```text
//! {"type":"sync","update":[...]}
//! {"type":"sync-chunk","messageId":"a-17...","chunk":0,"totalChunks":3,"update":[...]}
//! {"type":"awareness","update":[...],"compressed":false}
//! ```
//!
//! Payloads that fit under the chunk budget ride a single envelope; larger
//! ones are split into `ceil(n/budget)` chunks keyed by a per-message id.
//! Chunks carry their index, so reassembly is order-independent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{
    epoch_ms, CHUNK_HEADER_SIZE, MAX_CHUNK_SIZE, MAX_MEMORY_BUFFER_BYTES,
    MAX_MEMORY_BUFFER_ENTRIES, MESSAGE_BUFFER_RETENTION,
};
use crate::error::FramingError;

/// One data-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireEnvelope {
    Sync {
        update: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    SyncChunk {
        message_id: String,
        chunk: u32,
        total_chunks: u32,
        update: Vec<u8>,
    },
    Awareness {
        update: Vec<u8>,
        compressed: bool,
    },
}

impl WireEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        serde_json::to_vec(self).map_err(|e| FramingError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        serde_json::from_slice(bytes).map_err(|e| FramingError::DeserializationError(e.to_string()))
    }
}

/// Payload class being framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Sync,
    Awareness { compressed: bool },
}

/// Bytes reserved for the envelope skeleton around the payload.
fn envelope_overhead(kind: FrameKind) -> usize {
    match kind {
        FrameKind::Sync => 32,
        FrameKind::Awareness { .. } => 48,
    }
}

/// Raw-payload budget for a single envelope of `kind`.
pub fn chunk_budget(kind: FrameKind) -> usize {
    MAX_CHUNK_SIZE - CHUNK_HEADER_SIZE - envelope_overhead(kind)
}

/// Frame `payload` into one or more ready-to-send envelopes.
///
/// `self_id` seeds the message id for chunked payloads.
pub fn encode_frames(
    self_id: &str,
    kind: FrameKind,
    payload: &[u8],
) -> Result<Vec<Vec<u8>>, FramingError> {
    let budget = chunk_budget(kind);
    if payload.len() <= budget {
        let envelope = match kind {
            FrameKind::Sync => WireEnvelope::Sync {
                update: payload.to_vec(),
            },
            FrameKind::Awareness { compressed } => WireEnvelope::Awareness {
                update: payload.to_vec(),
                compressed,
            },
        };
        return Ok(vec![envelope.encode()?]);
    }

    let message_id = format!("{}-{}", self_id, epoch_ms());
    let chunks: Vec<&[u8]> = payload.chunks(budget).collect();
    let total_chunks = chunks.len() as u32;
    let mut frames = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.into_iter().enumerate() {
        frames.push(
            WireEnvelope::SyncChunk {
                message_id: message_id.clone(),
                chunk: index as u32,
                total_chunks,
                update: chunk.to_vec(),
            }
            .encode()?,
        );
    }
    Ok(frames)
}

// ───────────────────────────────────────────────────────────────────
// Reassembly
// ───────────────────────────────────────────────────────────────────

struct PartialMessage {
    total: u32,
    received: u32,
    chunks: Vec<Option<Vec<u8>>>,
    created_ms: i64,
}

/// Per-peer reassembly state, keyed by `(peer, messageId)`.
#[derive(Default)]
pub struct ReassemblyBuffers {
    buffers: HashMap<String, HashMap<String, PartialMessage>>,
}

impl ReassemblyBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one chunk. Returns the whole payload once every chunk is in;
    /// the buffer entry is freed at that point.
    pub fn insert(
        &mut self,
        peer: &str,
        message_id: &str,
        chunk: u32,
        total_chunks: u32,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, FramingError> {
        if total_chunks == 0 || chunk >= total_chunks {
            return Err(FramingError::ChunkOutOfRange {
                index: chunk,
                total: total_chunks,
            });
        }

        let per_peer = self.buffers.entry(peer.to_string()).or_default();
        let partial = per_peer
            .entry(message_id.to_string())
            .or_insert_with(|| PartialMessage {
                total: total_chunks,
                received: 0,
                chunks: vec![None; total_chunks as usize],
                created_ms: epoch_ms(),
            });

        if partial.total != total_chunks {
            let expected = partial.total;
            per_peer.remove(message_id);
            return Err(FramingError::ChunkCountMismatch {
                expected,
                got: total_chunks,
            });
        }

        let slot = &mut partial.chunks[chunk as usize];
        if slot.is_none() {
            *slot = Some(bytes);
            partial.received += 1;
        }

        if partial.received == partial.total {
            let done = per_peer.remove(message_id).expect("partial present");
            let mut payload = Vec::new();
            for chunk in done.chunks {
                payload.extend(chunk.expect("all chunks received"));
            }
            if per_peer.is_empty() {
                self.buffers.remove(peer);
            }
            return Ok(Some(payload));
        }
        Ok(None)
    }

    /// Free everything buffered for a peer (teardown path).
    pub fn drop_peer(&mut self, peer: &str) {
        self.buffers.remove(peer);
    }

    /// Free partial messages older than `max_age_ms`. Returns count freed.
    pub fn prune_older_than(&mut self, max_age_ms: i64) -> usize {
        let cutoff = epoch_ms() - max_age_ms;
        let mut freed = 0;
        self.buffers.retain(|_, per_peer| {
            per_peer.retain(|_, partial| {
                let keep = partial.created_ms > cutoff;
                if !keep {
                    freed += 1;
                }
                keep
            });
            !per_peer.is_empty()
        });
        freed
    }

    pub fn pending_messages(&self) -> usize {
        self.buffers.values().map(|m| m.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Traffic accounting
// ───────────────────────────────────────────────────────────────────

/// Point-in-time framer traffic totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Logical payloads handed to a peer's channel.
    pub messages_sent: u64,
    /// Envelopes decoded off the wire.
    pub messages_received: u64,
    /// Chunk envelopes emitted for payloads over the frame budget.
    pub chunks_sent: u64,
    /// Chunks consumed into completed reassemblies.
    pub chunks_reassembled: u64,
    /// Frames discarded at a gate: undecodable, bad chunk bookkeeping,
    /// or awareness arriving at the cardinality ceiling.
    pub dropped: u64,
}

/// Atomic traffic counters — no lock on the send/receive hot path.
/// Read via [`TrafficCounters::snapshot`].
#[derive(Default)]
pub struct TrafficCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_reassembled: AtomicU64,
    dropped: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// One logical payload went out as `frames` envelopes.
    pub fn record_sent(&self, frames: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if frames > 1 {
            self.chunks_sent.fetch_add(frames as u64, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A chunked message completed from `total_chunks` pieces.
    pub fn record_reassembled(&self, total_chunks: u32) {
        self.chunks_reassembled
            .fetch_add(u64::from(total_chunks), Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_reassembled: self.chunks_reassembled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Bounded message accounting
// ───────────────────────────────────────────────────────────────────

/// Sliding record of recent message sizes, bounded by entry count, total
/// bytes, and age. Feeds `getMemoryStats`, never the data path.
pub struct MessageBuffer {
    entries: VecDeque<(i64, usize)>,
    total_bytes: usize,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(256),
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, size: usize) {
        self.entries.push_back((epoch_ms(), size));
        self.total_bytes += size;
        self.enforce_caps();
    }

    /// Drop entries past the retention window.
    pub fn prune_expired(&mut self) {
        let cutoff = epoch_ms() - MESSAGE_BUFFER_RETENTION.as_millis() as i64;
        while let Some((ts, size)) = self.entries.front().copied() {
            if ts >= cutoff {
                break;
            }
            self.entries.pop_front();
            self.total_bytes -= size;
        }
    }

    fn enforce_caps(&mut self) {
        while self.entries.len() > MAX_MEMORY_BUFFER_ENTRIES
            || self.total_bytes > MAX_MEMORY_BUFFER_BYTES
        {
            match self.entries.pop_front() {
                Some((_, size)) => self.total_bytes -= size,
                None => break,
            }
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
