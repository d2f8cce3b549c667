//! Local update batching.
//!
//! Local CRDT edits often land in bursts (keystrokes, drag operations).
//! The first update in a burst arms a short window; every further update
//! re-arms it; when it fires, the accumulated updates are merged into one
//! minimal update and handed to the broadcast capability. A lone update
//! skips the merge entirely.
//!
//! Remote updates never enter this pipeline — the session only feeds it
//! updates whose origin is local, which is what keeps applied remote state
//! from echoing back out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{MIN_BROADCAST_UPDATE_SIZE, UPDATE_BATCH_WINDOW};
use crate::document::DocumentReplica;

/// Capability handed in by the peer manager: fan a merged update out.
pub type BroadcastSyncFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Clone)]
pub struct UpdatePipeline {
    inner: Arc<UpdateInner>,
}

struct UpdateInner {
    doc: Arc<DocumentReplica>,
    broadcast: BroadcastSyncFn,
    pending: Mutex<Vec<Vec<u8>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    window: Duration,
}

impl UpdatePipeline {
    pub fn new(doc: Arc<DocumentReplica>, broadcast: BroadcastSyncFn) -> Self {
        Self::with_window(doc, broadcast, UPDATE_BATCH_WINDOW)
    }

    pub fn with_window(
        doc: Arc<DocumentReplica>,
        broadcast: BroadcastSyncFn,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(UpdateInner {
                doc,
                broadcast,
                pending: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
                window,
            }),
        }
    }

    /// Queue a local update and (re)arm the batch window.
    pub fn notify_local_update(&self, update: Vec<u8>) {
        self.inner.pending.lock().expect("pending").push(update);

        let mut timer = self.inner.timer.lock().expect("timer");
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let inner = self.inner.clone();
        let window = self.inner.window;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            Self::flush_inner(&inner);
        }));
    }

    /// Flush whatever is pending right now (teardown, tests).
    pub fn flush_now(&self) {
        Self::flush_inner(&self.inner);
    }

    fn flush_inner(inner: &Arc<UpdateInner>) {
        let mut batch: Vec<Vec<u8>> = {
            let mut pending = inner.pending.lock().expect("pending");
            std::mem::take(&mut *pending)
        };

        let merged = match batch.len() {
            0 => return,
            1 => batch.pop().expect("one element"),
            _ => match inner.doc.merge_updates(&batch) {
                Ok(merged) => merged,
                Err(e) => {
                    // A merge failure must not drop edits; fall back to
                    // fanning the batch out update by update.
                    log::warn!("update merge failed, sending unmerged: {e}");
                    for update in batch {
                        if update.len() >= MIN_BROADCAST_UPDATE_SIZE {
                            (inner.broadcast)(update);
                        }
                    }
                    return;
                }
            },
        };

        if merged.len() < MIN_BROADCAST_UPDATE_SIZE {
            log::trace!("skipping no-op update ({} bytes)", merged.len());
            return;
        }
        (inner.broadcast)(merged);
    }

    /// Abort the pending window.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.timer.lock().expect("timer").take() {
            handle.abort();
        }
        self.inner.pending.lock().expect("pending").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, ReadTxn, Text, WriteTxn};

    fn pipeline_with_sink(
        doc: Arc<DocumentReplica>,
        window: Duration,
    ) -> (UpdatePipeline, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sent2 = sent.clone();
        let pipeline = UpdatePipeline::with_window(
            doc,
            Arc::new(move |update| sent2.lock().unwrap().push(update)),
            window,
        );
        (pipeline, sent)
    }

    fn edit(doc: &DocumentReplica, text: &str) -> Vec<u8> {
        let sv = doc.encode_state_vector();
        doc.update(|txn| {
            let t = txn.get_or_insert_text("content");
            let len = t.get_string(txn).len() as u32;
            t.insert(txn, len, text);
        });
        doc.encode_delta_since(&sv).unwrap()
    }

    #[tokio::test]
    async fn test_burst_merges_to_single_broadcast() {
        let doc = Arc::new(DocumentReplica::new());
        let (pipeline, sent) = pipeline_with_sink(doc.clone(), Duration::from_millis(20));

        for word in ["a", "b", "c"] {
            pipeline.notify_local_update(edit(&doc, word));
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);

        let receiver = DocumentReplica::new();
        receiver.apply_remote_update(&sent[0]).unwrap();
        let text = receiver.read(|txn| txn.get_text("content").unwrap().get_string(txn));
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn test_single_update_fast_path() {
        let doc = Arc::new(DocumentReplica::new());
        let (pipeline, sent) = pipeline_with_sink(doc.clone(), Duration::from_millis(10));

        let update = edit(&doc, "solo");
        pipeline.notify_local_update(update.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], update);
    }

    #[tokio::test]
    async fn test_new_update_resets_window() {
        let doc = Arc::new(DocumentReplica::new());
        let (pipeline, sent) = pipeline_with_sink(doc.clone(), Duration::from_millis(60));

        pipeline.notify_local_update(edit(&doc, "x"));
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(sent.lock().unwrap().is_empty());

        // Re-arms the window; the first timer never fires.
        pipeline.notify_local_update(edit(&doc, "y"));
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(sent.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tiny_updates_not_broadcast() {
        let doc = Arc::new(DocumentReplica::new());
        let (pipeline, sent) = pipeline_with_sink(doc.clone(), Duration::from_millis(10));

        pipeline.notify_local_update(vec![0, 0]);
        pipeline.flush_now();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let doc = Arc::new(DocumentReplica::new());
        let (pipeline, sent) = pipeline_with_sink(doc.clone(), Duration::from_millis(20));

        pipeline.notify_local_update(edit(&doc, "x"));
        pipeline.shutdown();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sent.lock().unwrap().is_empty());
    }
}
