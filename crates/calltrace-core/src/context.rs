//! Call stack context propagation
//!
//! The active call stack lives in a tokio task-local. Every traced call runs its body
//! inside [`CallStack::scope`] with a freshly pushed stack, so:
//!
//! - nested calls made from inside the body see the pushed stack, even after the body
//!   suspends and resumes;
//! - sibling futures polled by the same task (e.g. `join!`) each carry their own scope,
//!   and tokio swaps the value in and out on every poll, so they never observe each other;
//! - when the body completes the scope ends and the caller's stack is visible again.
//!
//! Stacks are immutable and shared behind an `Arc`; pushing allocates a new stack.
//! `tokio::spawn` does not inherit task-locals, use [`spawn`] to carry the caller's
//! stack into a new task.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

tokio::task_local! {
    static CALL_STACK: CallStack;
}

/// One frame of the call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStackEntry {
    pub call_id: String,
    pub trace_id: String,
}

/// Ancestry chain of calls active in the current logical task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    entries: Arc<Vec<CallStackEntry>>,
}

impl CallStack {
    /// An empty stack (no active call)
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack visible to the current task, empty outside any traced call
    pub fn current() -> Self {
        CALL_STACK.try_with(|stack| stack.clone()).unwrap_or_default()
    }

    /// New stack with `entry` on top; `self` is left untouched
    pub fn push(&self, entry: CallStackEntry) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());
        entries.push(entry);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New stack without the top entry
    pub fn pop(&self) -> Self {
        let len = self.entries.len().saturating_sub(1);
        Self {
            entries: Arc::new(self.entries[..len].to_vec()),
        }
    }

    /// The innermost active call
    pub fn current_call(&self) -> Option<&CallStackEntry> {
        self.entries.last()
    }

    /// The caller of the innermost active call
    pub fn parent_call(&self) -> Option<&CallStackEntry> {
        let len = self.entries.len();
        if len >= 2 {
            self.entries.get(len - 2)
        } else {
            None
        }
    }

    pub fn entries(&self) -> &[CallStackEntry] {
        &self.entries
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `fut` with this stack active, across every suspension point
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CALL_STACK.scope(self, fut).await
    }

    /// Run `f` synchronously with this stack active
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CALL_STACK.sync_scope(self, f)
    }
}

/// Spawn `fut` on the tokio runtime, carrying the caller's call stack into it
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let stack = CallStack::current();
    tokio::spawn(stack.scope(fut))
}
