//! Calls - one traced invocation of an op
//!
//! A [`Call`] is created when a wrapped function is entered and finished exactly once
//! when it returns or fails. The client never ships `Call` objects directly; it ships
//! the [`CallEvent`]s derived from them.

use crate::context::CallStackEntry;
use crate::op::OpDef;
use crate::refs::ObjectRef;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Running,
    Success,
    Error,
}

/// One invocation of an op
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Unique call ID (ULID)
    pub id: String,

    /// Trace this call belongs to
    pub trace_id: String,

    /// Parent call ID, `None` for a root call
    pub parent_id: Option<String>,

    /// Reference of the op that was invoked
    pub op_ref: ObjectRef,

    /// Human-readable op name
    pub op_name: String,

    /// Display name computed from the call arguments
    pub display_name: Option<String>,

    pub started_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Captured inputs
    pub inputs: Value,

    /// Captured output (success only)
    pub output: Option<Value>,

    /// Rendered error (failure only)
    pub exception: Option<String>,

    pub status: CallStatus,
}

impl Call {
    /// Start a call under `parent`, inheriting its trace; a root call opens a new trace
    pub fn start(
        op_name: impl Into<String>,
        op_ref: ObjectRef,
        parent: Option<&CallStackEntry>,
        inputs: Value,
    ) -> Self {
        let id = ulid::Ulid::new().to_string();
        let (trace_id, parent_id) = match parent {
            Some(p) => (p.trace_id.clone(), Some(p.call_id.clone())),
            None => (ulid::Ulid::new().to_string(), None),
        };

        Self {
            id,
            trace_id,
            parent_id,
            op_ref,
            op_name: op_name.into(),
            display_name: None,
            started_at: Utc::now(),
            ended_at: None,
            inputs,
            output: None,
            exception: None,
            status: CallStatus::Running,
        }
    }

    /// Mark the call succeeded with `output`
    pub fn finish(&mut self, output: Value) {
        self.ended_at = Some(self.end_time());
        self.output = Some(output);
        self.status = CallStatus::Success;
    }

    /// Mark the call failed with `error`
    pub fn fail(&mut self, error: impl Into<String>) {
        self.ended_at = Some(self.end_time());
        self.exception = Some(error.into());
        self.status = CallStatus::Error;
    }

    // The wall clock may step backwards; an end never precedes its start.
    fn end_time(&self) -> DateTime<Utc> {
        Utc::now().max(self.started_at)
    }

    pub fn is_finished(&self) -> bool {
        self.status != CallStatus::Running
    }

    /// Call duration (if finished)
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Call duration in seconds (if finished)
    pub fn latency_secs(&self) -> Option<f64> {
        self.duration()
            .and_then(|d| d.to_std().ok())
            .map(|d| d.as_secs_f64())
    }

    /// Entry for the call stack pushed while this call's body runs
    pub fn stack_entry(&self) -> CallStackEntry {
        CallStackEntry {
            call_id: self.id.clone(),
            trace_id: self.trace_id.clone(),
        }
    }

    pub fn start_event(&self) -> CallStart {
        CallStart {
            id: self.id.clone(),
            trace_id: self.trace_id.clone(),
            parent_id: self.parent_id.clone(),
            op_ref: self.op_ref.clone(),
            op_name: self.op_name.clone(),
            display_name: self.display_name.clone(),
            started_at: self.started_at,
            inputs: self.inputs.clone(),
        }
    }

    /// Terminal event, `None` while the call is still running
    pub fn end_event(&self) -> Option<CallEnd> {
        let ended_at = self.ended_at?;
        Some(CallEnd {
            id: self.id.clone(),
            ended_at,
            output: self.output.clone(),
            exception: self.exception.clone(),
        })
    }

    /// Rebuild a running call from its start event
    pub fn from_start(start: CallStart) -> Self {
        Self {
            id: start.id,
            trace_id: start.trace_id,
            parent_id: start.parent_id,
            op_ref: start.op_ref,
            op_name: start.op_name,
            display_name: start.display_name,
            started_at: start.started_at,
            ended_at: None,
            inputs: start.inputs,
            output: None,
            exception: None,
            status: CallStatus::Running,
        }
    }

    /// Apply a terminal event received from a log or backend
    pub fn apply_end(&mut self, end: &CallEnd) {
        self.ended_at = Some(end.ended_at.max(self.started_at));
        self.output = end.output.clone();
        self.exception = end.exception.clone();
        self.status = if end.exception.is_some() {
            CallStatus::Error
        } else {
            CallStatus::Success
        };
    }
}

/// Fields sent when a call starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStart {
    pub id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub op_ref: ObjectRef,
    pub op_name: String,
    pub display_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub inputs: Value,
}

/// Fields sent when a call ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnd {
    pub id: String,
    pub ended_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Mutable call attributes changed after start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallUpdate {
    pub id: String,
    pub display_name: Option<String>,
}

/// Everything the client delivers to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    SaveOp { op_ref: ObjectRef, op: OpDef },
    CallStart(CallStart),
    CallEnd(CallEnd),
    CallUpdate(CallUpdate),
}

impl CallEvent {
    /// Call this event belongs to (`None` for op saves)
    pub fn call_id(&self) -> Option<&str> {
        match self {
            CallEvent::SaveOp { .. } => None,
            CallEvent::CallStart(s) => Some(&s.id),
            CallEvent::CallEnd(e) => Some(&e.id),
            CallEvent::CallUpdate(u) => Some(&u.id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallEvent::SaveOp { .. } => "save_op",
            CallEvent::CallStart(_) => "call_start",
            CallEvent::CallEnd(_) => "call_end",
            CallEvent::CallUpdate(_) => "call_update",
        }
    }
}

/// Fold a stream of events back into calls, in call-start order.
///
/// Ends and updates for calls whose start was never seen are ignored.
pub fn fold_call_events<'a>(events: impl IntoIterator<Item = &'a CallEvent>) -> Vec<Call> {
    let mut calls: Vec<Call> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        match event {
            CallEvent::SaveOp { .. } => {}
            CallEvent::CallStart(start) => {
                index.insert(start.id.clone(), calls.len());
                calls.push(Call::from_start(start.clone()));
            }
            CallEvent::CallEnd(end) => {
                if let Some(&i) = index.get(&end.id) {
                    calls[i].apply_end(end);
                }
            }
            CallEvent::CallUpdate(update) => {
                if let Some(&i) = index.get(&update.id) {
                    calls[i].display_name = update.display_name.clone();
                }
            }
        }
    }

    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::RefKind;
    use serde_json::json;

    fn op_ref() -> ObjectRef {
        ObjectRef::new("e", "p", RefKind::Op, "add", "d")
    }

    #[test]
    fn test_root_call_opens_trace() {
        let call = Call::start("add", op_ref(), None, json!({"a": 1}));
        assert!(call.parent_id.is_none());
        assert_ne!(call.id, call.trace_id);
        assert_eq!(call.status, CallStatus::Running);
        assert!(call.end_event().is_none());
    }

    #[test]
    fn test_child_inherits_trace() {
        let parent = Call::start("outer", op_ref(), None, Value::Null);
        let child = Call::start("inner", op_ref(), Some(&parent.stack_entry()), Value::Null);
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn test_finish_and_fail() {
        let mut ok = Call::start("add", op_ref(), None, Value::Null);
        ok.finish(json!(3));
        assert_eq!(ok.status, CallStatus::Success);
        assert!(ok.ended_at.unwrap() >= ok.started_at);
        assert!(ok.latency_secs().unwrap() >= 0.0);

        let mut bad = Call::start("add", op_ref(), None, Value::Null);
        bad.fail("boom");
        assert_eq!(bad.status, CallStatus::Error);
        let end = bad.end_event().unwrap();
        assert_eq!(end.exception.as_deref(), Some("boom"));
        assert!(end.output.is_none());
    }

    #[test]
    fn test_apply_end_clamps_to_start() {
        let call = Call::start("add", op_ref(), None, Value::Null);
        let mut rebuilt = Call::from_start(call.start_event());
        rebuilt.apply_end(&CallEnd {
            id: call.id.clone(),
            ended_at: call.started_at - Duration::seconds(5),
            output: Some(json!(1)),
            exception: None,
        });
        assert_eq!(rebuilt.ended_at, Some(rebuilt.started_at));
        assert_eq!(rebuilt.status, CallStatus::Success);
    }

    #[test]
    fn test_event_tagging() {
        let call = Call::start("add", op_ref(), None, json!({"a": 1}));
        let event = CallEvent::CallStart(call.start_event());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "call_start");
        assert_eq!(json["op_ref"], "calltrace:///e/p/op/add:d");
        assert_eq!(event.call_id(), Some(call.id.as_str()));
    }

    #[test]
    fn test_fold_call_events() {
        let mut a = Call::start("a", op_ref(), None, Value::Null);
        let b = Call::start("b", op_ref(), Some(&a.stack_entry()), Value::Null);
        a.finish(json!("done"));

        let events = vec![
            CallEvent::CallStart(a.start_event()),
            CallEvent::CallStart(b.start_event()),
            CallEvent::CallUpdate(CallUpdate {
                id: b.id.clone(),
                display_name: Some("renamed".to_string()),
            }),
            CallEvent::CallEnd(a.end_event().unwrap()),
            CallEvent::CallEnd(CallEnd {
                id: "unknown".to_string(),
                ended_at: Utc::now(),
                output: None,
                exception: Some("ignored".to_string()),
            }),
        ];

        let calls = fold_call_events(&events);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].status, CallStatus::Success);
        assert_eq!(calls[0].output, Some(json!("done")));
        assert_eq!(calls[1].status, CallStatus::Running);
        assert_eq!(calls[1].display_name.as_deref(), Some("renamed"));
    }
}
