//! Presence and lifecycle tests: liveness records, stale-peer reaping,
//! and teardown hygiene across whole sessions.

use std::sync::Arc;

use meshdoc::{
    config::epoch_ms, ConnectionStatus, MemoryRtc, MemorySubstrate, Session, SessionConfig,
    Substrate,
};
use serde_json::json;
use tokio::time::Duration;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn session_on(substrate: &MemorySubstrate, peer_id: &str) -> Arc<Session> {
    let config = SessionConfig::new("doc-1").with_peer_id(peer_id);
    let session = Session::new(
        config,
        Arc::new(substrate.clone()),
        MemoryRtc::new().connector(),
    )
    .unwrap();
    session.start().await.unwrap();
    session
}

// ─── Liveness records ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_session_announces_itself() {
    let substrate = MemorySubstrate::new();
    let a = session_on(&substrate, "aaaa").await;

    let record = substrate
        .read("rooms/peers/aaaa")
        .await
        .unwrap()
        .expect("presence record");
    assert_eq!(record["id"], "aaaa");
    assert!(record["lastSeen"].as_i64().unwrap() > 0);

    a.disconnect().await;
    assert!(substrate.read("rooms/peers/aaaa").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_crash_is_covered_by_disconnect_binding() {
    let substrate = MemorySubstrate::new();
    let a = session_on(&substrate, "aaaa").await;
    assert!(substrate.read("rooms/peers/aaaa").await.unwrap().is_some());

    // Hard crash: no disconnect() runs, the server-side binding fires.
    drop(a);
    substrate.simulate_disconnect().await;
    assert!(substrate.read("rooms/peers/aaaa").await.unwrap().is_none());
}

// ─── Stale peer reaping (GC) ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_stale_peer_reaped_within_one_cleanup_interval() {
    let substrate = MemorySubstrate::new();
    let a = session_on(&substrate, "aaaa").await;

    // Peer C crashed eleven minutes ago without the binding firing.
    substrate
        .write(
            "rooms/peers/cccc",
            json!({ "id": "cccc", "lastSeen": epoch_ms() - 11 * 60 * 1000 }),
        )
        .await
        .unwrap();
    substrate
        .write("signaling/cccc/stale-offer", json!({ "type": "offer" }))
        .await
        .unwrap();

    // One cleanup interval (5 min) later both artifacts are gone.
    tokio::time::sleep(Duration::from_secs(5 * 60 + 30)).await;
    assert!(substrate.read("rooms/peers/cccc").await.unwrap().is_none());
    assert!(substrate
        .read("signaling/cccc/stale-offer")
        .await
        .unwrap()
        .is_none());

    // The live session's own record survived.
    assert!(substrate.read("rooms/peers/aaaa").await.unwrap().is_some());
    a.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_discovery_ignores_stale_records() {
    let substrate = MemorySubstrate::new();

    // A stale record for a larger id is already present when we join.
    substrate
        .write(
            "rooms/peers/zzzz",
            json!({ "id": "zzzz", "lastSeen": epoch_ms() - 20 * 60 * 1000 }),
        )
        .await
        .unwrap();

    let a = session_on(&substrate, "aaaa").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // No connection slot was ever created for it.
    assert_eq!(a.peer_count(), 0);
    assert_eq!(a.memory_stats().connection_count, 0);
    a.disconnect().await;
}

// ─── Teardown hygiene ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_disconnect_leaves_no_residue() {
    let substrate = MemorySubstrate::new();
    let rtc = MemoryRtc::new();
    let mk = |peer: &str| {
        let config = SessionConfig::new("doc-1").with_peer_id(peer);
        Session::new(config, Arc::new(substrate.clone()), rtc.connector()).unwrap()
    };
    let a = mk("aaaa");
    let b = mk("bbbb");
    a.start().await.unwrap();
    b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.peer_count(), 1);

    a.disconnect().await;
    b.disconnect().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Called twice: still quiet.
    a.disconnect().await;
    b.disconnect().await;

    assert_eq!(a.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(b.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(a.peer_count(), 0);
    assert_eq!(a.memory_stats().awareness_states, 0);

    // No substrate listeners and no presence records left behind.
    assert_eq!(substrate.subscription_count(), 0);
    assert!(substrate.read("rooms/peers/aaaa").await.unwrap().is_none());
    assert!(substrate.read("rooms/peers/bbbb").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_visibility_cycle_keeps_presence_fresh() {
    let substrate = MemorySubstrate::new();
    let a = session_on(&substrate, "aaaa").await;

    let first = substrate.read("rooms/peers/aaaa").await.unwrap().unwrap()["lastSeen"]
        .as_i64()
        .unwrap();

    a.notify_hidden();
    // Hidden tabs skip the scheduled heartbeat.
    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    let hidden = substrate.read("rooms/peers/aaaa").await.unwrap().unwrap()["lastSeen"]
        .as_i64()
        .unwrap();
    assert_eq!(hidden, first);

    // Becoming visible forces one (the 2-minute limiter allows it).
    a.notify_visible().await;
    let visible = substrate.read("rooms/peers/aaaa").await.unwrap().unwrap()["lastSeen"]
        .as_i64()
        .unwrap();
    assert!(visible >= hidden);

    a.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_flush_before_close_persists_and_retires() {
    let substrate = MemorySubstrate::new();
    let a = session_on(&substrate, "aaaa").await;

    a.document().update(|txn| {
        use yrs::{Text, WriteTxn};
        let t = txn.get_or_insert_text("content");
        t.insert(txn, 0, "last words");
    });

    a.flush_before_close();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(substrate.read("snapshots/latest").await.unwrap().is_some());
    assert!(substrate.read("rooms/peers/aaaa").await.unwrap().is_none());
}
