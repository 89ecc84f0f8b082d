//! The replication engine: one pull loop and one push loop per instance,
//! spawned as tokio tasks and owned by a [`Replication`] handle.
//!
//! Pull applies remote change batches to the store atomically together with
//! the checkpoint advance; push scans locally-originated writes past the
//! acknowledged cursor and sends them out. Both loops retry failed cycles
//! with exponential backoff inside the `Active` state; repeated remote
//! rejections of one document quarantine it instead of retrying forever.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tidepool_store::{ReplicationKey, Store};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReplicationConfig;
use crate::error::{Result, SyncError};
use crate::remote::{Checkpoint, RemoteCollection};

/// Lifecycle of a replication instance. Transient pull/push failures are a
/// backoff-and-retry holding pattern inside `Active`, not a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationStatus {
    Initializing,
    Active,
    Paused,
    Canceled,
}

#[derive(Clone, Debug)]
pub enum ReplicationEvent {
    /// One remote document applied locally.
    Received { collection: String, id: String },
    /// One local document acknowledged remote-side.
    Sent { collection: String, id: String },
    /// A failed cycle or a quarantine, carrying the cause.
    Error(Arc<SyncError>),
    /// Cycle running (`true`) or idle (`false`).
    Active(bool),
    /// Terminal; observed exactly once.
    Canceled,
}

/// Handle to a running replication. Dropping the handle does not stop the
/// loops; call [`Replication::cancel`].
pub struct Replication {
    key: ReplicationKey,
    status_tx: watch::Sender<ReplicationStatus>,
    events_tx: broadcast::Sender<ReplicationEvent>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Replication {
    /// Load persisted checkpoint state and spawn the pull and push loops.
    pub async fn start(
        store: Store,
        remote: Arc<dyn RemoteCollection>,
        config: ReplicationConfig,
    ) -> Result<Self> {
        let key = ReplicationKey {
            local_collection: config.local_collection.clone(),
            remote_collection: config.remote_collection.clone(),
            identifier: config.identifier.clone(),
        };
        let (status_tx, status_rx) = watch::channel(ReplicationStatus::Initializing);
        let (events_tx, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        let state = store.replication_state(&key).await?;
        info!(
            collection = %key.local_collection,
            identifier = %key.identifier,
            has_checkpoint = state.checkpoint.is_some(),
            push_seq = state.push_seq,
            "starting replication"
        );

        let ctx = LoopCtx {
            store,
            remote,
            config: Arc::new(config),
            key: key.clone(),
            events: events_tx.clone(),
            cancel: cancel.clone(),
            wake: wake.clone(),
            status: status_rx,
        };
        let pull = tokio::spawn(pull_loop(ctx.clone(), state.checkpoint));
        let push = tokio::spawn(push_loop(ctx, state.push_seq));
        status_tx.send_replace(ReplicationStatus::Active);

        Ok(Self {
            key,
            status_tx,
            events_tx,
            cancel,
            wake,
            tasks: Mutex::new(Some((pull, push))),
        })
    }

    pub fn key(&self) -> &ReplicationKey {
        &self.key
    }

    pub fn events(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ReplicationStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ReplicationStatus> {
        self.status_tx.subscribe()
    }

    /// Hold both loops at their next iteration.
    pub fn pause(&self) {
        let current = *self.status_tx.borrow();
        if current == ReplicationStatus::Active {
            self.status_tx.send_replace(ReplicationStatus::Paused);
            info!(collection = %self.key.local_collection, "replication paused");
        }
    }

    pub fn resume(&self) {
        let current = *self.status_tx.borrow();
        if current == ReplicationStatus::Paused {
            self.status_tx.send_replace(ReplicationStatus::Active);
            self.wake.notify_waiters();
            info!(collection = %self.key.local_collection, "replication resumed");
        }
    }

    /// Nudge both loops to run ahead of their poll interval. An application
    /// shell can wire any realtime change signal to this.
    pub fn resync(&self) {
        self.wake.notify_waiters();
    }

    /// Stop both loops and wait for them. Idempotent: the second call is a
    /// no-op, and the `Canceled` event is emitted exactly once. Batches are
    /// transactions, so cancellation never leaves one partially applied.
    pub async fn cancel(&self) {
        let mut tasks = self.tasks.lock().await;
        let Some((pull, push)) = tasks.take() else {
            return;
        };
        self.status_tx.send_replace(ReplicationStatus::Canceled);
        self.cancel.cancel();
        self.wake.notify_waiters();
        let _ = pull.await;
        let _ = push.await;
        let _ = self.events_tx.send(ReplicationEvent::Canceled);
        info!(collection = %self.key.local_collection, "replication canceled");
    }
}

#[derive(Clone)]
struct LoopCtx {
    store: Store,
    remote: Arc<dyn RemoteCollection>,
    config: Arc<ReplicationConfig>,
    key: ReplicationKey,
    events: broadcast::Sender<ReplicationEvent>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    status: watch::Receiver<ReplicationStatus>,
}

impl LoopCtx {
    fn emit(&self, event: ReplicationEvent) {
        // No receivers is fine; events are observability, not control flow.
        let _ = self.events.send(event);
    }

    fn set_busy(&self, busy: &mut bool, now: bool) {
        if *busy != now {
            *busy = now;
            self.emit(ReplicationEvent::Active(now));
        }
    }

    /// Returns `true` once the instance is canceled.
    async fn hold_while_paused(&mut self) -> bool {
        loop {
            let current = *self.status.borrow();
            match current {
                ReplicationStatus::Canceled => return true,
                ReplicationStatus::Paused => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return true,
                        changed = self.status.changed() => {
                            if changed.is_err() {
                                return true;
                            }
                        }
                    }
                }
                _ => return self.cancel.is_cancelled(),
            }
        }
    }

    /// Sleep for `delay` unless woken or canceled; `true` means canceled.
    async fn wait(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = self.wake.notified() => false,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

async fn pull_loop(mut ctx: LoopCtx, mut checkpoint: Option<Checkpoint>) {
    let mut attempt: u32 = 0;
    let mut busy = false;

    loop {
        if ctx.hold_while_paused().await {
            break;
        }

        let batch = ctx
            .remote
            .changes_since(checkpoint.as_ref(), ctx.config.pull_batch_size)
            .await;
        match batch {
            Ok(batch) if batch.documents.is_empty() => {
                attempt = 0;
                ctx.set_busy(&mut busy, false);
                if ctx.wait(ctx.config.poll_interval()).await {
                    break;
                }
            }
            Ok(batch) => {
                ctx.set_busy(&mut busy, true);
                // A feed may hand out documents without a new cursor; keep the
                // old one rather than persisting null and rewinding the feed.
                let next = batch
                    .checkpoint
                    .clone()
                    .or_else(|| checkpoint.clone())
                    .unwrap_or(Value::Null);
                match ctx
                    .store
                    .apply_pull_batch(&ctx.key, &batch.documents, &next)
                    .await
                {
                    Ok(outcome) => {
                        attempt = 0;
                        debug!(
                            collection = %ctx.key.local_collection,
                            applied = outcome.applied.len(),
                            kept_local = outcome.kept_local.len(),
                            "pull batch applied"
                        );
                        for id in outcome.applied {
                            ctx.emit(ReplicationEvent::Received {
                                collection: ctx.key.local_collection.clone(),
                                id,
                            });
                        }
                        checkpoint = Some(next);
                        // Keep draining until the feed is empty.
                    }
                    Err(err) => {
                        let err = SyncError::from(err);
                        let delay = ctx.config.backoff(attempt);
                        warn!(
                            collection = %ctx.key.local_collection,
                            attempt,
                            delay_secs = delay.as_secs(),
                            %err,
                            "pull apply failed, backing off"
                        );
                        attempt = attempt.saturating_add(1);
                        ctx.emit(ReplicationEvent::Error(Arc::new(err)));
                        if ctx.wait(delay).await {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                let delay = ctx.config.backoff(attempt);
                warn!(
                    collection = %ctx.key.local_collection,
                    attempt,
                    delay_secs = delay.as_secs(),
                    %err,
                    "pull cycle failed, backing off"
                );
                attempt = attempt.saturating_add(1);
                ctx.emit(ReplicationEvent::Error(Arc::new(err)));
                ctx.set_busy(&mut busy, false);
                if ctx.wait(delay).await {
                    break;
                }
            }
        }
    }
    debug!(collection = %ctx.key.local_collection, "pull loop stopped");
}

async fn push_loop(mut ctx: LoopCtx, mut cursor: i64) {
    let primary_key = ctx
        .store
        .schemas()
        .get(&ctx.key.local_collection)
        .map(|s| s.primary_key.clone())
        .unwrap_or_else(|| "id".to_string());
    let mut attempt: u32 = 0;
    let mut busy = false;
    // Consecutive remote rejections per document id, reset by any success.
    let mut rejections: HashMap<String, u32> = HashMap::new();

    'outer: loop {
        if ctx.hold_while_paused().await {
            break;
        }

        let pending = match ctx
            .store
            .pending_push(&ctx.key.local_collection, cursor, ctx.config.push_batch_size)
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                let err = SyncError::from(err);
                warn!(collection = %ctx.key.local_collection, %err, "push scan failed");
                let delay = ctx.config.backoff(attempt);
                attempt = attempt.saturating_add(1);
                ctx.emit(ReplicationEvent::Error(Arc::new(err)));
                if ctx.wait(delay).await {
                    break;
                }
                continue;
            }
        };

        if pending.is_empty() {
            attempt = 0;
            ctx.set_busy(&mut busy, false);
            if ctx.wait(ctx.config.poll_interval()).await {
                break;
            }
            continue;
        }

        ctx.set_busy(&mut busy, true);
        for item in pending {
            if ctx.cancel.is_cancelled() {
                break 'outer;
            }
            let id = item
                .doc
                .get(&primary_key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            match push_doc(ctx.remote.as_ref(), &id, &item.doc).await {
                Ok(()) => {
                    attempt = 0;
                    rejections.remove(&id);
                    cursor = item.local_seq;
                    if let Err(err) = ctx.store.advance_push_seq(&ctx.key, cursor).await {
                        ctx.emit(ReplicationEvent::Error(Arc::new(err.into())));
                    }
                    debug!(collection = %ctx.key.local_collection, id = %id, "pushed document");
                    ctx.emit(ReplicationEvent::Sent {
                        collection: ctx.key.local_collection.clone(),
                        id,
                    });
                }
                Err(err) if err.is_rejection() => {
                    let count = rejections.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if *count >= ctx.config.quarantine_after {
                        let attempts = *count;
                        rejections.remove(&id);
                        error!(
                            collection = %ctx.key.local_collection,
                            id = %id,
                            attempts,
                            "quarantining poisoned document"
                        );
                        if let Err(store_err) = ctx
                            .store
                            .quarantine(&ctx.key.local_collection, &id, attempts, &err.to_string())
                            .await
                        {
                            ctx.emit(ReplicationEvent::Error(Arc::new(store_err.into())));
                        }
                        ctx.emit(ReplicationEvent::Error(Arc::new(
                            SyncError::PoisonedDocument {
                                collection: ctx.key.local_collection.clone(),
                                id,
                                attempts,
                            },
                        )));
                        // Later pending documents are unaffected.
                        continue;
                    }
                    let delay = ctx.config.backoff(attempt);
                    warn!(
                        collection = %ctx.key.local_collection,
                        id = %id,
                        rejection = *count,
                        delay_secs = delay.as_secs(),
                        %err,
                        "push rejected, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                    ctx.emit(ReplicationEvent::Error(Arc::new(err)));
                    if ctx.wait(delay).await {
                        break 'outer;
                    }
                    continue 'outer;
                }
                Err(err) => {
                    let delay = ctx.config.backoff(attempt);
                    warn!(
                        collection = %ctx.key.local_collection,
                        id = %id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        %err,
                        "push cycle failed, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                    ctx.emit(ReplicationEvent::Error(Arc::new(err)));
                    ctx.set_busy(&mut busy, false);
                    if ctx.wait(delay).await {
                        break 'outer;
                    }
                    continue 'outer;
                }
            }
        }
    }
    debug!(collection = %ctx.key.local_collection, "push loop stopped");
}

/// Upsert: update, falling back to create when the remote has no such
/// document yet.
async fn push_doc(remote: &dyn RemoteCollection, id: &str, doc: &Value) -> Result<()> {
    match remote.update_document(id, doc.clone()).await {
        Ok(_) => Ok(()),
        Err(SyncError::RemoteRejected { status: 404, .. }) => {
            remote.create_document(id, doc.clone()).await.map(|_| ())
        }
        Err(err) => Err(err),
    }
}
