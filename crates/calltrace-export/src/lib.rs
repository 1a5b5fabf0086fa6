//! Backends for calltrace

pub mod connect;
pub mod jsonl;

#[cfg(feature = "http")]
pub mod http;

pub use connect::{connect, init_client};
pub use jsonl::{read_call_log, read_events, JsonlBackend, JsonlBackendConfig};

#[cfg(feature = "http")]
pub use http::{HttpBackend, HttpBackendConfig};
