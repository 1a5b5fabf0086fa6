//! Process-wide default client
//!
//! Library code takes its client explicitly. Applications that want a single shared
//! client install it once at startup and fetch it at their entry points.

use crate::client::TraceClient;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::warn;

static CLIENT: OnceCell<Arc<TraceClient>> = OnceCell::new();

/// Install the default client.
///
/// Returns the client that ends up installed: `client` on the first call, the
/// previously installed one afterwards.
pub fn init(client: Arc<TraceClient>) -> Arc<TraceClient> {
    let installed = CLIENT.get_or_init(|| client.clone());
    if !Arc::ptr_eq(installed, &client) {
        warn!("Default trace client already initialized, keeping the existing one");
    }
    installed.clone()
}

/// The default client, if one was installed
pub fn client() -> Option<Arc<TraceClient>> {
    CLIENT.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::client::ClientConfig;

    #[test]
    fn test_init_is_first_wins() {
        let first = TraceClient::new(Arc::new(MemoryBackend::new()), ClientConfig::default());
        let second = TraceClient::new(Arc::new(MemoryBackend::new()), ClientConfig::default());

        let installed = init(first.clone());
        assert!(Arc::ptr_eq(&installed, &first));
        assert!(Arc::ptr_eq(&init(second), &first));
        assert!(Arc::ptr_eq(&client().unwrap(), &first));
    }
}
