//! Trace client and batch processor
//!
//! Producers (any number of concurrent call chains) enqueue [`CallEvent`]s without
//! touching the network. A single consumer, either the background flush loop or an
//! explicit [`TraceClient::flush`], drains the queue in batches and hands them to the
//! backend under a request timeout.
//!
//! Delivery policy:
//! - failed batches are retried up to `max_retries` times per event, non-retryable
//!   failures drop the batch;
//! - after a partial failure only the unaccepted tail is re-queued, at the head of the
//!   queue, so a call's start is never delivered after its end;
//! - the queue is bounded; on overflow the oldest call event is dropped, and if it was
//!   a call start the call's later events are dropped with it. Op saves are only
//!   evicted when nothing else is queued;
//! - an op whose save is dropped is forgotten, so its next call queues the save again.

use crate::backend::TraceBackend;
use crate::call::{Call, CallEvent, CallUpdate};
use crate::error::{BackendError, BackendResult};
use crate::op::OpDef;
use crate::refs::{ObjectRef, RefKind};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MIN_DRAIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_DRAIN_BACKOFF: Duration = Duration::from_secs(2);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Entity (owner) used in object references
    pub entity: String,

    /// Project used in object references
    pub project: String,

    /// Maximum events per backend request
    pub batch_size: usize,

    /// Interval between background flushes
    pub flush_interval: Duration,

    /// Maximum queued events before the oldest are dropped
    pub max_queue_size: usize,

    /// Delivery attempts per event after the first
    pub max_retries: u32,

    /// Timeout for one backend request
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            entity: "default".to_string(),
            project: "default".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_millis(200),
            max_queue_size: 10_000,
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub enqueued: u64,
    pub sent: u64,
    pub retried: u64,
    pub dropped: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub pending: usize,
}

struct QueuedEvent {
    event: CallEvent,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<QueuedEvent>,

    /// Calls whose start was dropped; their later events are discarded too
    dropped_starts: HashSet<String>,
}

impl QueueState {
    fn discard(&mut self, event: &CallEvent) {
        match event {
            CallEvent::CallStart(start) => {
                self.dropped_starts.insert(start.id.clone());
            }
            CallEvent::CallEnd(end) => {
                self.dropped_starts.remove(&end.id);
            }
            CallEvent::SaveOp { .. } | CallEvent::CallUpdate(_) => {}
        }
    }

    /// Whether `event` belongs to a call whose start was dropped
    fn is_orphaned(&mut self, event: &CallEvent) -> bool {
        match event {
            CallEvent::CallEnd(end) => self.dropped_starts.remove(&end.id),
            CallEvent::CallUpdate(update) => self.dropped_starts.contains(&update.id),
            CallEvent::SaveOp { .. } | CallEvent::CallStart(_) => false,
        }
    }
}

/// Queues call events and delivers them to a [`TraceBackend`] in batches
pub struct TraceClient {
    backend: Arc<dyn TraceBackend>,
    config: ClientConfig,
    queue: Mutex<QueueState>,
    saved_ops: Mutex<HashMap<String, ObjectRef>>,
    flush_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    closed: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,

    events_enqueued: AtomicU64,
    events_sent: AtomicU64,
    events_retried: AtomicU64,
    events_dropped: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
}

impl fmt::Debug for TraceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceClient")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl TraceClient {
    /// Create a client.
    ///
    /// When called inside a tokio runtime the background flush loop is started;
    /// otherwise events are only delivered by explicit flushes.
    pub fn new(backend: Arc<dyn TraceBackend>, config: ClientConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            backend,
            config,
            queue: Mutex::new(QueueState::default()),
            saved_ops: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            flush_task: Mutex::new(None),
            events_enqueued: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_retried: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(flush_loop(
                    Arc::downgrade(&client),
                    client.wake.clone(),
                    client.config.flush_interval,
                ));
                *client.flush_task.lock() = Some(task);
                debug!(
                    "Trace client started (backend: {}, batch size: {})",
                    client.backend.name(),
                    client.config.batch_size
                );
            }
            Err(_) => {
                debug!("No tokio runtime, background flushing disabled");
            }
        }

        client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn TraceBackend> {
        &self.backend
    }

    /// Reference for `op` in this client's project, saving it on first use
    pub fn save_op(&self, op: &OpDef) -> ObjectRef {
        let (op_ref, first) = {
            let mut saved = self.saved_ops.lock();
            match saved.get(&op.digest) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let op_ref = ObjectRef::new(
                        &self.config.entity,
                        &self.config.project,
                        RefKind::Op,
                        &op.name,
                        &op.digest,
                    );
                    saved.insert(op.digest.clone(), op_ref.clone());
                    (op_ref, true)
                }
            }
        };

        if first {
            debug!("Saving op {}", op_ref);
            self.enqueue(CallEvent::SaveOp {
                op_ref: op_ref.clone(),
                op: op.clone(),
            });
        }
        op_ref
    }

    /// Queue the start event of `call`
    pub fn create_call(&self, call: &Call) {
        self.enqueue(CallEvent::CallStart(call.start_event()));
    }

    /// Finish `call` successfully and queue its end event
    pub fn finish_call(&self, call: &mut Call, output: Value) {
        call.finish(output);
        self.enqueue_end(call);
    }

    /// Finish `call` with an error and queue its end event
    pub fn finish_call_with_exception(&self, call: &mut Call, error: impl fmt::Display) {
        call.fail(error.to_string());
        self.enqueue_end(call);
    }

    fn enqueue_end(&self, call: &Call) {
        if let Some(end) = call.end_event() {
            self.enqueue(CallEvent::CallEnd(end));
        }
    }

    /// Queue a display name change for a call
    pub fn update_call(&self, call_id: impl Into<String>, display_name: Option<String>) {
        self.enqueue(CallEvent::CallUpdate(CallUpdate {
            id: call_id.into(),
            display_name,
        }));
    }

    fn enqueue(&self, event: CallEvent) {
        let len = {
            let mut queue = self.queue.lock();
            queue.events.push_back(QueuedEvent { event, attempts: 0 });
            self.enforce_bound(&mut queue);
            queue.events.len()
        };
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);

        if len >= self.config.batch_size {
            self.wake.notify_one();
        }
    }

    fn enforce_bound(&self, queue: &mut QueueState) {
        while queue.events.len() > self.config.max_queue_size {
            let victim = queue
                .events
                .iter()
                .position(|item| !matches!(item.event, CallEvent::SaveOp { .. }))
                .unwrap_or(0);
            if let Some(evicted) = queue.events.remove(victim) {
                warn!(
                    "Trace queue full ({} events), dropping oldest {} event",
                    self.config.max_queue_size,
                    evicted.event.kind()
                );
                self.drop_event(queue, &evicted.event);
            }
        }
    }

    /// Account for an event that will never be delivered
    fn drop_event(&self, queue: &mut QueueState, event: &CallEvent) {
        queue.discard(event);
        if let CallEvent::SaveOp { op, .. } = event {
            self.saved_ops.lock().remove(&op.digest);
        }
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of events waiting for delivery
    pub fn pending(&self) -> usize {
        self.queue.lock().events.len()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            enqueued: self.events_enqueued.load(Ordering::Relaxed),
            sent: self.events_sent.load(Ordering::Relaxed),
            retried: self.events_retried.load(Ordering::Relaxed),
            dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    fn take_batch(&self) -> Vec<QueuedEvent> {
        let mut queue = self.queue.lock();
        let mut batch = Vec::with_capacity(self.config.batch_size.min(queue.events.len()));

        while batch.len() < self.config.batch_size {
            let Some(item) = queue.events.pop_front() else {
                break;
            };
            if queue.is_orphaned(&item.event) {
                debug!(
                    "Dropping {} of call {:?} whose start was dropped",
                    item.event.kind(),
                    item.event.call_id()
                );
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            batch.push(item);
        }
        batch
    }

    async fn send(&self, events: &[CallEvent]) -> BackendResult<()> {
        match tokio::time::timeout(
            self.config.request_timeout,
            self.backend.upsert_batch(events),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        }
    }

    fn requeue(&self, failed: Vec<QueuedEvent>, err: &BackendError) {
        let mut queue = self.queue.lock();

        if !err.is_retryable() {
            error!(
                "Backend {} rejected {} events, dropping them: {}",
                self.backend.name(),
                failed.len(),
                err
            );
            for item in &failed {
                self.drop_event(&mut queue, &item.event);
            }
            return;
        }

        let mut retry = Vec::with_capacity(failed.len());
        for mut item in failed {
            item.attempts += 1;
            if item.attempts > self.config.max_retries {
                warn!(
                    "Giving up on {} event after {} attempts: {}",
                    item.event.kind(),
                    item.attempts,
                    err
                );
                self.drop_event(&mut queue, &item.event);
            } else {
                retry.push(item);
            }
        }

        self.events_retried
            .fetch_add(retry.len() as u64, Ordering::Relaxed);
        for item in retry.into_iter().rev() {
            queue.events.push_front(item);
        }
        self.enforce_bound(&mut queue);
    }

    /// Deliver queued events until the queue is empty or a batch fails.
    ///
    /// Returns the number of events the backend accepted.
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;
        let mut delivered = 0;

        loop {
            let mut batch = self.take_batch();
            if batch.is_empty() {
                break;
            }

            let events: Vec<CallEvent> = batch.iter().map(|item| item.event.clone()).collect();
            match self.send(&events).await {
                Ok(()) => {
                    delivered += events.len();
                    self.events_sent
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                    self.batches_sent.fetch_add(1, Ordering::Relaxed);
                    debug!("Delivered batch of {} events", events.len());
                }
                Err(e) => {
                    let accepted = e.accepted().min(batch.len());
                    delivered += accepted;
                    self.events_sent
                        .fetch_add(accepted as u64, Ordering::Relaxed);
                    self.batches_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Batch delivery to {} failed after {} of {} events: {}",
                        self.backend.name(),
                        accepted,
                        batch.len(),
                        e
                    );
                    let failed = batch.split_off(accepted);
                    self.requeue(failed, &e);
                    break;
                }
            }
        }

        delivered
    }

    /// Drain the queue completely.
    ///
    /// Returns once every queued event was delivered or dropped under the retry
    /// policy. Short-lived processes call this before exiting.
    pub async fn wait_for_batch_processing(&self) {
        let mut backoff = MIN_DRAIN_BACKOFF;
        loop {
            let delivered = self.flush().await;
            if self.pending() == 0 {
                break;
            }
            if delivered == 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_DRAIN_BACKOFF);
            } else {
                backoff = MIN_DRAIN_BACKOFF;
            }
        }
    }

    /// Load a previously-saved object from the backend
    pub async fn resolve_ref(&self, object_ref: &ObjectRef) -> BackendResult<Value> {
        match tokio::time::timeout(
            self.config.request_timeout,
            self.backend.resolve_ref(object_ref),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout),
        }
    }

    /// Stop the flush loop and drain the queue
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.wait_for_batch_processing().await;

        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        let stats = self.stats();
        info!(
            "Trace client shut down: {} sent, {} dropped, {} retried",
            stats.sent, stats.dropped, stats.retried
        );
    }
}

impl Drop for TraceClient {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().events.len();
        if pending > 0 {
            warn!(
                "Trace client dropped with {} undelivered events; call wait_for_batch_processing before exit",
                pending
            );
        }
        if let Some(task) = self.flush_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn flush_loop(client: Weak<TraceClient>, wake: Arc<Notify>, interval: Duration) {
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(client) = client.upgrade() else {
            break;
        };
        if client.closed.load(Ordering::SeqCst) {
            break;
        }
        if client.pending() > 0 {
            client.flush().await;
        }
    }
}
