//! Live queries: an explicit subscriber registry per store plus a single
//! dispatcher task draining a FIFO queue of committed-write notices.
//!
//! Every committed write enqueues the affected collection name
//! (synchronous-enqueue); the dispatcher re-evaluates registered queries for
//! that collection in commit order and sends fresh snapshots to subscription
//! channels (asynchronous-deliver). A snapshot is sent only when the visible
//! result set actually changed, judged by a fingerprint over the ordered
//! `(id, local_seq)` pairs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::document::StoredDocument;
use crate::query::Query;

type Fingerprint = Vec<(String, i64)>;

pub(crate) fn fingerprint(docs: &[StoredDocument], primary_key: &str) -> Fingerprint {
    docs.iter()
        .map(|d| {
            let id = d
                .doc
                .get(primary_key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (id, d.local_seq)
        })
        .collect()
}

struct LiveEntry {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<Value>>,
    fingerprint: Fingerprint,
    cancelled: Arc<AtomicBool>,
}

pub(crate) struct LiveRegistry {
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, LiveEntry>>,
    notice_tx: mpsc::UnboundedSender<String>,
}

impl LiveRegistry {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            next_id: AtomicU64::new(1),
            subs: Mutex::new(HashMap::new()),
            notice_tx,
        });
        (registry, notice_rx)
    }

    /// Enqueue a committed-write notice. Called after every successful commit,
    /// from any mutation path. A send failure means the dispatcher is gone
    /// (store closed), which is fine to ignore.
    pub(crate) fn notify(&self, collection: &str) {
        let _ = self.notice_tx.send(collection.to_string());
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        query: Query,
        initial: Vec<StoredDocument>,
        primary_key: &str,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = LiveEntry {
            query,
            tx,
            fingerprint: fingerprint(&initial, primary_key),
            cancelled: cancelled.clone(),
        };
        self.subs
            .lock()
            .expect("live registry poisoned")
            .insert(id, entry);
        Subscription {
            id,
            initial: initial.into_iter().map(|d| d.doc).collect(),
            rx,
            cancelled,
            registry: self.clone(),
        }
    }

    fn remove(&self, id: u64) {
        self.subs.lock().expect("live registry poisoned").remove(&id);
    }

    /// Queries registered over `collection`, snapshotted for re-evaluation.
    pub(crate) fn affected(&self, collection: &str) -> Vec<(u64, Query)> {
        self.subs
            .lock()
            .expect("live registry poisoned")
            .iter()
            .filter(|(_, e)| e.query.collection == collection)
            .map(|(id, e)| (*id, e.query.clone()))
            .collect()
    }

    /// Deliver a re-evaluated snapshot if the subscription still exists, is
    /// not cancelled, and the result set actually changed.
    pub(crate) fn deliver(&self, id: u64, docs: Vec<StoredDocument>, primary_key: &str) {
        let mut subs = self.subs.lock().expect("live registry poisoned");
        let Some(entry) = subs.get_mut(&id) else {
            return;
        };
        if entry.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let fp = fingerprint(&docs, primary_key);
        if fp == entry.fingerprint {
            return;
        }
        entry.fingerprint = fp;
        let snapshot: Vec<Value> = docs.into_iter().map(|d| d.doc).collect();
        if entry.tx.send(snapshot).is_err() {
            debug!(subscription = id, "live query receiver dropped");
        }
    }
}

/// A live result set: the snapshot taken at subscribe time plus a stream of
/// updated snapshots, delivered in commit order, each update at most once.
pub struct Subscription {
    id: u64,
    initial: Vec<Value>,
    rx: mpsc::UnboundedReceiver<Vec<Value>>,
    cancelled: Arc<AtomicBool>,
    registry: Arc<LiveRegistry>,
}

impl Subscription {
    /// The result set as of subscription time.
    pub fn initial(&self) -> &[Value] {
        &self.initial
    }

    /// Wait for the next updated snapshot. Returns `None` once cancelled or
    /// the store is closed.
    pub async fn next(&mut self) -> Option<Vec<Value>> {
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        let snapshot = self.rx.recv().await?;
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        Some(snapshot)
    }

    /// Stop delivery. Synchronous: after this returns the dispatcher will not
    /// begin any new delivery for this subscription, and `next()` returns
    /// `None` even for an update already in flight. Idempotent; a new
    /// subscription with the same query can always be opened afterwards.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.registry.remove(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
