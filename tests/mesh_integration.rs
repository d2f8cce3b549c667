//! End-to-end mesh tests over the in-memory substrate and transport.
//!
//! These build whole sessions, let discovery and non-trickle negotiation
//! run for real, and assert on document state and emitted events. Time is
//! paused: tokio auto-advances past batch windows and debounces, so the
//! tests are fast while still exercising every timer.

use std::sync::{Arc, Mutex};

use meshdoc::{
    ConnectionStatus, MemoryRtc, MemorySubstrate, Session, SessionConfig, SessionEvent,
    Substrate,
};
use tokio::time::Duration;
use yrs::{GetString, ReadTxn, Text, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Rig {
    substrate: MemorySubstrate,
    rtc: MemoryRtc,
}

impl Rig {
    fn new() -> Self {
        Self {
            substrate: MemorySubstrate::new(),
            rtc: MemoryRtc::new(),
        }
    }

    async fn session(&self, peer_id: &str) -> Arc<Session> {
        let config = SessionConfig::new("doc-1").with_peer_id(peer_id);
        let session = Session::new(
            config,
            Arc::new(self.substrate.clone()),
            self.rtc.connector(),
        )
        .unwrap();
        session.start().await.unwrap();
        session
    }
}

/// Insert `text` at `index` into the shared "content" text.
fn insert(session: &Session, index: u32, text: &str) {
    session.document().update(|txn| {
        let t = txn.get_or_insert_text("content");
        t.insert(txn, index, text);
    });
}

fn text_of(session: &Session) -> String {
    session.document().read(|txn| {
        txn.get_text("content")
            .map(|t| t.get_string(txn))
            .unwrap_or_default()
    })
}

/// Collect every event a session emits into a shared vec.
fn record_events(session: &Session) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.on(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// Let queued work and short timers drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

// ─── Two-peer mesh ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_second_peer_receives_existing_content() {
    let rig = Rig::new();

    let a = rig.session("aaaa").await;
    insert(&a, 0, "foo");
    settle().await;

    let b = rig.session("bbbb").await;
    settle().await;

    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
    assert_eq!(text_of(&b), "foo");

    // Late edit propagates the other way.
    insert(&b, 3, "bar");
    settle().await;
    assert_eq!(text_of(&a), "foobar");

    // Traffic accounting saw both directions, and nothing was dropped.
    let a_traffic = a.traffic_stats();
    let b_traffic = b.traffic_stats();
    assert!(a_traffic.messages_sent >= 1);
    assert!(a_traffic.messages_received >= 1);
    assert!(b_traffic.messages_received >= 1);
    assert_eq!(a_traffic.dropped, 0);
    assert_eq!(b_traffic.dropped, 0);

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_status_transitions() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    assert_eq!(a.connection_status(), ConnectionStatus::Connecting);

    let events = record_events(&a);
    let b = rig.session("bbbb").await;
    settle().await;

    assert_eq!(a.connection_status(), ConnectionStatus::Connected);
    let saw_connected = events.lock().unwrap().iter().any(|e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged {
                state: ConnectionStatus::Connected
            }
        )
    });
    assert!(saw_connected);

    let saw_joined = events.lock().unwrap().iter().any(|e| {
        matches!(e, SessionEvent::PeerJoined { peer_id, .. } if peer_id == "bbbb")
    });
    assert!(saw_joined);

    b.disconnect().await;
    settle().await;
    let saw_left = events.lock().unwrap().iter().any(|e| {
        matches!(e, SessionEvent::PeerLeft { peer_id } if peer_id == "bbbb")
    });
    assert!(saw_left);
    assert_eq!(a.peer_count(), 0);

    a.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_initiator_is_lexicographically_smaller() {
    let substrate = MemorySubstrate::new();

    // Count offers landing in each inbox before any session starts.
    let offers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for target in ["aaaa", "bbbb", "cccc"] {
        let sink = offers.clone();
        let to = target.to_string();
        substrate
            .subscribe_child_added(
                &format!("signaling/{target}"),
                Arc::new(move |_, value| {
                    if value["type"] == "offer" {
                        sink.lock().unwrap().push(to.clone());
                    }
                }),
            )
            .await
            .unwrap();
    }

    let rig = Rig {
        substrate: substrate.clone(),
        rtc: MemoryRtc::new(),
    };
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    let c = rig.session("cccc").await;
    settle().await;

    assert_eq!(a.peer_count(), 2);
    assert_eq!(b.peer_count(), 2);
    assert_eq!(c.peer_count(), 2);

    // Exactly one offer per pair, always toward the larger id:
    // aaaa→bbbb, aaaa→cccc, bbbb→cccc.
    let mut received = offers.lock().unwrap().clone();
    received.sort();
    assert_eq!(received, vec!["bbbb", "cccc", "cccc"]);

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

// ─── Convergence ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_three_peer_concurrent_edits_converge() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    let c = rig.session("cccc").await;
    settle().await;

    insert(&a, 0, "alpha ");
    insert(&b, 0, "beta ");
    insert(&c, 0, "gamma ");
    settle().await;

    let text = text_of(&a);
    assert_eq!(text, text_of(&b));
    assert_eq!(text, text_of(&c));
    for word in ["alpha ", "beta ", "gamma "] {
        assert!(text.contains(word), "{word:?} missing from {text:?}");
    }

    // Convergence in the strict sense: identical version summaries.
    use yrs::updates::decoder::Decode;
    let sv = yrs::StateVector::decode_v1(&a.document().encode_state_vector()).unwrap();
    assert_eq!(
        sv,
        yrs::StateVector::decode_v1(&b.document().encode_state_vector()).unwrap()
    );
    assert_eq!(
        sv,
        yrs::StateVector::decode_v1(&c.document().encode_state_vector()).unwrap()
    );

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

// ─── Echo suppression ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_remote_apply_does_not_echo() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    settle().await;

    let a_events = record_events(&a);
    let b_events = record_events(&b);

    insert(&a, 0, "ping");
    settle().await;
    assert_eq!(text_of(&b), "ping");

    let b_syncs = |events: &Arc<Mutex<Vec<SessionEvent>>>| {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SessionEvent::SyncCompleted { .. }))
            .count()
    };

    // B applied exactly one sync; A applied none (B had nothing to say,
    // and B's apply must not bounce the update back).
    assert_eq!(b_syncs(&b_events), 1);
    assert_eq!(b_syncs(&a_events), 0);

    // A long quiet period produces no further traffic.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(b_syncs(&b_events), 1);
    assert_eq!(b_syncs(&a_events), 0);

    a.disconnect().await;
    b.disconnect().await;
}

// ─── Chunking ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_large_update_crosses_in_chunks() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    settle().await;

    // ~80 KiB of text forces a multi-chunk sync (32 KiB frame ceiling).
    let big: String = "lorem ipsum dolor sit amet ".repeat(3100);
    assert!(big.len() > 80 * 1024);
    insert(&a, 0, &big);
    settle().await;

    assert_eq!(text_of(&b), big);
    // Reassembly buffers are freed once the message completes.
    assert_eq!(b.memory_stats().pending_reassemblies, 0);

    // The payload really went out chunked, and every chunk was consumed
    // into the reassembled message on the far side.
    let chunks_sent = a.traffic_stats().chunks_sent;
    assert!(chunks_sent >= 3, "expected >=3 chunks, sent {chunks_sent}");
    assert_eq!(b.traffic_stats().chunks_reassembled, chunks_sent);

    a.disconnect().await;
    b.disconnect().await;
}

// ─── Reconnect after partition ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_partition_heals_with_delta_sync() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    settle().await;

    let body = "x".repeat(1_000);
    insert(&a, 0, &body);
    settle().await;
    assert_eq!(text_of(&b), body);

    // The network drops under both peers.
    rig.rtc.fail_all_links();
    settle().await;
    assert_eq!(a.peer_count(), 0);
    assert_eq!(b.peer_count(), 0);

    // A keeps editing while partitioned.
    insert(&a, 1_000, "y");

    let b_events = record_events(&b);
    // Discovery re-pairs on its own (records republish after teardown).
    settle().await;
    settle().await;

    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
    assert_eq!(text_of(&b), format!("{body}y"));

    // The healing sync was a delta, not the full document.
    let full = a.document().encode_full_state().len();
    let sizes: Vec<usize> = b_events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SyncCompleted { update_size, .. } => Some(*update_size),
            _ => None,
        })
        .collect();
    assert!(!sizes.is_empty());
    assert!(
        sizes.iter().all(|s| *s < full),
        "expected deltas smaller than full state {full}, got {sizes:?}"
    );

    a.disconnect().await;
    b.disconnect().await;
}

// ─── Awareness ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_awareness_flows_between_peers() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    settle().await;

    let b_events = record_events(&b);
    a.set_awareness_field("cursor", serde_json::json!({ "x": 10, "y": 20 }));
    settle().await;

    assert_eq!(b.memory_stats().awareness_states, 2);
    let saw_awareness = b_events.lock().unwrap().iter().any(|e| {
        matches!(e, SessionEvent::AwarenessUpdated { peer_id, .. } if peer_id == "aaaa")
    });
    assert!(saw_awareness);

    a.disconnect().await;
    b.disconnect().await;
}

// ─── Reconnect operation ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_explicit_reconnect_reforms_mesh() {
    let rig = Rig::new();
    let a = rig.session("aaaa").await;
    let b = rig.session("bbbb").await;
    settle().await;
    assert_eq!(a.peer_count(), 1);

    let events = record_events(&a);
    a.reconnect().await.unwrap();

    let saw_connecting = events.lock().unwrap().iter().any(|e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged {
                state: ConnectionStatus::Connecting
            }
        )
    });
    assert!(saw_connecting);

    settle().await;
    settle().await;
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);

    insert(&a, 0, "after-reconnect");
    settle().await;
    assert_eq!(text_of(&b), "after-reconnect");

    a.disconnect().await;
    b.disconnect().await;
}
