//! Process-wide endpoint → client registry.
//!
//! `get_or_create` hands back the cached client for an endpoint, creating
//! and connecting one the first time. The connect runs on a spawned task so
//! the caller can attach event listeners before the first status event
//! fires. Clients are not evicted on disconnect; a reconnected client keeps
//! its identity, and applications that want a fresh one disconnect and
//! discard explicitly.

use crate::controller::BrainClient;
use crate::error::Result;
use crate::types::BrainOptions;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

const DEFAULT_PORT: u16 = 8000;

/// Where to find the brain.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A literal `host` or `host:port` (port defaults to 8000)
    Literal(String),
    /// Resolve from an environment variable, with a fallback
    Auto {
        /// Environment variable holding the endpoint
        var: String,
        /// Fallback when the variable is unset
        default: String,
    },
}

impl Endpoint {
    /// Resolve to a concrete `host:port` string.
    pub fn resolve(&self) -> String {
        let raw = match self {
            Self::Literal(s) => s.clone(),
            Self::Auto { var, default } => match std::env::var(var) {
                Ok(value) if !value.is_empty() => value,
                _ => default.clone(),
            },
        };
        if raw.contains(':') {
            raw
        } else {
            format!("{raw}:{DEFAULT_PORT}")
        }
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_string())
    }
}

/// Endpoint → client map with idempotent insertion.
#[derive(Default)]
pub struct Registry {
    clients: Mutex<HashMap<String, BrainClient>>,
}

impl Registry {
    /// Create an empty registry. Most callers want [`registry`] instead.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached client for `endpoint`, or a freshly created one with a
    /// connect scheduled in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_create(
        &self,
        endpoint: impl Into<Endpoint>,
        opts: BrainOptions,
    ) -> Result<BrainClient> {
        let resolved = endpoint.into().resolve();
        let mut clients = self.clients.lock().unwrap();

        if let Some(existing) = clients.get(&resolved) {
            debug!(endpoint = %resolved, "reusing cached client");
            return Ok(existing.clone());
        }

        let client = BrainClient::new(resolved.clone(), opts)?;
        clients.insert(resolved.clone(), client.clone());

        // Deferred so the caller can subscribe before any status fires.
        let background = client.clone();
        tokio::spawn(async move {
            if let Err(e) = background.connect_to_controller().await {
                warn!(endpoint = %background.endpoint(), "background connect failed: {e}");
            }
        });

        Ok(client)
    }

    /// The cached client for an already-resolved endpoint, if any.
    pub fn get(&self, endpoint: &str) -> Option<BrainClient> {
        self.clients.lock().unwrap().get(endpoint).cloned()
    }

    /// Drop a client from the cache. Does not disconnect it.
    pub fn discard(&self, endpoint: &str) -> Option<BrainClient> {
        self.clients.lock().unwrap().remove(endpoint)
    }
}

/// The process-wide registry.
pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn literal_endpoints_default_the_port() {
        assert_eq!(Endpoint::Literal("10.0.0.5".into()).resolve(), "10.0.0.5:8000");
        assert_eq!(
            Endpoint::Literal("10.0.0.5:9001".into()).resolve(),
            "10.0.0.5:9001"
        );
    }

    #[test]
    fn auto_endpoint_falls_back_to_default() {
        let endpoint = Endpoint::Auto {
            var: "BRAINLINK_TEST_UNSET_VAR".into(),
            default: "127.0.0.1".into(),
        };
        assert_eq!(endpoint.resolve(), "127.0.0.1:8000");
    }

    #[tokio::test]
    async fn same_endpoint_yields_the_same_client() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("127.0.0.1:9101", BrainOptions::default())
            .unwrap();
        let b = registry
            .get_or_create("127.0.0.1:9101", BrainOptions::default())
            .unwrap();
        let c = registry
            .get_or_create("127.0.0.1:9102", BrainOptions::default())
            .unwrap();

        assert!(Arc::ptr_eq(&a.shared, &b.shared));
        assert!(!Arc::ptr_eq(&a.shared, &c.shared));
    }

    #[tokio::test]
    async fn discard_leaves_the_client_running() {
        let registry = Registry::new();
        let a = registry
            .get_or_create("127.0.0.1:9103", BrainOptions::default())
            .unwrap();
        let discarded = registry.discard("127.0.0.1:9103").unwrap();
        assert!(Arc::ptr_eq(&a.shared, &discarded.shared));
        assert!(registry.get("127.0.0.1:9103").is_none());
    }
}
