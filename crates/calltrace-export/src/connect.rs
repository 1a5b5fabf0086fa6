//! Backend selection from configuration

use calltrace_core::config::{BackendSettings, CalltraceConfig};
use calltrace_core::{BackendError, BackendResult, MemoryBackend, TraceBackend, TraceClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::jsonl::{JsonlBackend, JsonlBackendConfig};

/// Open the backend named by `[backend]`
#[cfg_attr(not(feature = "http"), allow(unused_variables))]
pub fn connect(
    settings: &BackendSettings,
    request_timeout: Duration,
) -> BackendResult<Arc<dyn TraceBackend>> {
    let backend: Arc<dyn TraceBackend> = match settings.kind.to_lowercase().as_str() {
        "jsonl" => Arc::new(JsonlBackend::open(JsonlBackendConfig::new(&settings.path))?),
        #[cfg(feature = "http")]
        "http" => {
            let mut config = crate::http::HttpBackendConfig::new(&settings.url);
            config.timeout = request_timeout;
            Arc::new(crate::http::HttpBackend::new(config)?)
        }
        "memory" => Arc::new(MemoryBackend::new()),
        other => {
            return Err(BackendError::Other(anyhow::anyhow!(
                "Unsupported backend: {}",
                other
            )))
        }
    };

    info!("Using {} backend", backend.name());
    Ok(backend)
}

/// Build a client for `config` and install it as the process-wide default
pub fn init_client(config: &CalltraceConfig) -> BackendResult<Arc<TraceClient>> {
    let client_config = config.client.to_client_config();
    let backend = connect(&config.backend, client_config.request_timeout)?;
    Ok(calltrace_core::global::init(TraceClient::new(backend, client_config)))
}
