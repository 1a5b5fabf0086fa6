//! Backend collaborator
//!
//! A [`TraceBackend`] receives call events and saved ops, and resolves references to
//! previously-saved objects. The client only ever talks to it in batches through
//! [`TraceBackend::upsert_batch`]; the default implementation dispatches each event to
//! the per-event methods and reports how far it got on failure.

use crate::call::{fold_call_events, Call, CallEnd, CallEvent, CallStart, CallUpdate};
use crate::error::{BackendError, BackendResult};
use crate::op::OpDef;
use crate::refs::ObjectRef;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Destination for call events
#[async_trait]
pub trait TraceBackend: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    async fn call_start(&self, start: &CallStart) -> BackendResult<()>;

    async fn call_end(&self, end: &CallEnd) -> BackendResult<()>;

    async fn call_update(&self, update: &CallUpdate) -> BackendResult<()> {
        let _ = update;
        Ok(())
    }

    /// Save an op under `op_ref`; idempotent.
    ///
    /// References are content-addressed by the client, so calls carry `op_ref` as given
    /// and the backend must store the op under exactly that reference.
    async fn save_op(&self, op_ref: &ObjectRef, op: &OpDef) -> BackendResult<()>;

    /// Load a previously-saved object
    async fn resolve_ref(&self, object_ref: &ObjectRef) -> BackendResult<Value>;

    /// Deliver a batch in order.
    ///
    /// On failure after some events were accepted, returns [`BackendError::Partial`]
    /// with the number of accepted events so the caller only retries the rest.
    async fn upsert_batch(&self, events: &[CallEvent]) -> BackendResult<()> {
        for (i, event) in events.iter().enumerate() {
            let result = match event {
                CallEvent::SaveOp { op_ref, op } => self.save_op(op_ref, op).await,
                CallEvent::CallStart(start) => self.call_start(start).await,
                CallEvent::CallEnd(end) => self.call_end(end).await,
                CallEvent::CallUpdate(update) => self.call_update(update).await,
            };

            if let Err(e) = result {
                return Err(if i == 0 {
                    e
                } else {
                    BackendError::Partial {
                        sent: i,
                        source: Box::new(e),
                    }
                });
            }
        }
        Ok(())
    }
}

/// Scripted outcome for the next batch delivered to a [`MemoryBackend`]
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Retryable network failure, nothing accepted
    Network,
    /// Non-retryable rejection, nothing accepted
    Reject(u16),
    /// Accept the first `n` events, then fail with a retryable error
    Partial(usize),
}

/// In-memory backend that records everything it receives
#[derive(Default)]
pub struct MemoryBackend {
    events: Mutex<Vec<CallEvent>>,
    batch_sizes: Mutex<Vec<usize>>,
    objects: Mutex<HashMap<String, Value>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail upcoming batches in order, one scripted failure per batch
    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.failures.lock().push(failure);
    }

    /// Delay every batch, to exercise request timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Store an object that `resolve_ref` can return
    pub fn put_object(&self, object_ref: &ObjectRef, value: Value) {
        self.objects.lock().insert(object_ref.uri(), value);
    }

    /// Every event accepted, in delivery order
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    /// Sizes of accepted batches (partial batches count what was accepted)
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Calls reconstructed from the accepted events
    pub fn calls(&self) -> Vec<Call> {
        fold_call_events(self.events.lock().iter())
    }

    pub fn saved_ops(&self) -> Vec<OpDef> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallEvent::SaveOp { op, .. } => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn accept(&self, events: &[CallEvent]) {
        for event in events {
            if let CallEvent::SaveOp { op_ref, op } = event {
                if let Ok(value) = serde_json::to_value(op) {
                    self.objects.lock().insert(op_ref.uri(), value);
                }
            }
        }
        self.events.lock().extend(events.iter().cloned());
        self.batch_sizes.lock().push(events.len());
    }
}

#[async_trait]
impl TraceBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn call_start(&self, start: &CallStart) -> BackendResult<()> {
        self.accept(&[CallEvent::CallStart(start.clone())]);
        Ok(())
    }

    async fn call_end(&self, end: &CallEnd) -> BackendResult<()> {
        self.accept(&[CallEvent::CallEnd(end.clone())]);
        Ok(())
    }

    async fn call_update(&self, update: &CallUpdate) -> BackendResult<()> {
        self.accept(&[CallEvent::CallUpdate(update.clone())]);
        Ok(())
    }

    async fn save_op(&self, op_ref: &ObjectRef, op: &OpDef) -> BackendResult<()> {
        self.accept(&[CallEvent::SaveOp {
            op_ref: op_ref.clone(),
            op: op.clone(),
        }]);
        Ok(())
    }

    async fn resolve_ref(&self, object_ref: &ObjectRef) -> BackendResult<Value> {
        self.objects
            .lock()
            .get(&object_ref.uri())
            .cloned()
            .ok_or_else(|| BackendError::NotFound(object_ref.uri()))
    }

    async fn upsert_batch(&self, events: &[CallEvent]) -> BackendResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut failures = self.failures.lock();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };

        match failure {
            None => {
                self.accept(events);
                Ok(())
            }
            Some(ScriptedFailure::Network) => {
                Err(BackendError::Network("connection reset".to_string()))
            }
            Some(ScriptedFailure::Reject(status)) => {
                Err(BackendError::rejected(status, "batch rejected"))
            }
            Some(ScriptedFailure::Partial(n)) => {
                let n = n.min(events.len());
                self.accept(&events[..n]);
                Err(BackendError::Partial {
                    sent: n,
                    source: Box::new(BackendError::Network("connection reset".to_string())),
                })
            }
        }
    }
}
