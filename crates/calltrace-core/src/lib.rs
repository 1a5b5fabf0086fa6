//! calltrace core - call tracing runtime
//!
//! This crate provides the pieces every traced application needs:
//!
//! - **Ops**: named, instrumented functions and the call lifecycle around them
//! - **Context**: the active call stack, propagated across `.await` points
//! - **Client**: a bounded, batching queue that delivers call events to a backend
//! - **Tree**: trace reconstruction from flat parent pointers
//! - **Config**: TOML configuration with env overrides

pub mod backend;
pub mod call;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod global;
pub mod op;
pub mod refs;
pub mod tree;

// Re-export commonly used types
pub use backend::{MemoryBackend, ScriptedFailure, TraceBackend};
pub use call::{fold_call_events, Call, CallEnd, CallEvent, CallStart, CallStatus, CallUpdate};
pub use client::{ClientConfig, ClientStats, TraceClient};
pub use config::{CalltraceConfig, ConfigError, ConfigLoader, ConfigResult};
pub use context::{CallStack, CallStackEntry};
pub use error::{BackendError, BackendResult, RefError};
pub use op::{derive_op_name, traced, Op, OpBuilder, OpDef, TracedFn};
pub use refs::{ObjectRef, RefKind};
pub use tree::{topological_sort, CallTree};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
