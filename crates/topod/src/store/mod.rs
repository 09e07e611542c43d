//! Versioned key/value store access.
//!
//! The rest of the crate only needs two operations from a store: a recursive
//! fetch of a set of keys, flattened to leaf paths, and a long-poll on a key
//! prefix that resolves to a new version index. Both live on [`StoreClient`].

pub mod etcd;
pub mod memory;
mod node;

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use thiserror::Error;

pub use etcd::{EtcdClient, EtcdConfig};
pub use memory::MemoryStore;
pub use node::StoreNode;

use crate::error::ConfigError;

/// Errors reported by a store backend. Callers decide what to retry with
/// [`StoreError::is_retryable`], never by inspecting the message.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No store node reachable ({nodes}): {reason}")]
    Unreachable { nodes: String, reason: String },

    #[error("Request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Store returned {status} for '{url}': {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Failed to decode response from '{url}': {reason}")]
    Decode { url: String, reason: String },

    #[error("Watch on '{prefix}' expired without changes")]
    WatchTimeout { prefix: String },

    #[error("Watch stopped")]
    Stopped,
}

impl StoreError {
    /// Returns true if the same call may succeed when issued again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unreachable { .. } | StoreError::WatchTimeout { .. } => true,
            StoreError::Request { source, .. } => source.is_timeout() || source.is_connect(),
            StoreError::Status { status, .. } => *status >= 500,
            StoreError::Decode { .. } | StoreError::Stopped => false,
        }
    }

    /// A long-poll that ended without a change. Expected and silent.
    pub fn is_watch_timeout(&self) -> bool {
        matches!(self, StoreError::WatchTimeout { .. })
    }
}

/// Access to a versioned key/value store.
pub trait StoreClient: Send + Sync {
    /// Resolves every key, expanding directories into one entry per leaf keyed
    /// by its full path. Missing keys contribute nothing. Either every key
    /// resolves or the first error is returned.
    fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError>;

    /// With `wait_index == 0`, returns the current index for `prefix` at once.
    /// Otherwise blocks until something under `prefix` changes past
    /// `wait_index` and returns the new index, or returns
    /// [`StoreError::Stopped`] once `stop` is closed.
    ///
    /// `stop` is a broadcast signal: it fires when every sender is dropped.
    fn watch_prefix(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &Receiver<()>,
    ) -> Result<u64, StoreError>;
}

/// Backend selection for [`new_client`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: String,
    pub etcd: EtcdConfig,
}

/// Builds the configured backend.
pub fn new_client(config: &StoreConfig) -> Result<Arc<dyn StoreClient>, ConfigError> {
    let backend = if config.backend.is_empty() {
        "etcd"
    } else {
        config.backend.as_str()
    };
    log::info!("Store backend {} with nodes {:?}", backend, config.etcd.nodes);
    match backend {
        "etcd" => Ok(Arc::new(EtcdClient::new(config.etcd.clone())?)),
        other => Err(ConfigError::UnknownStore(other.to_string())),
    }
}

/// Joins key path segments into a normalized absolute key: a single leading
/// `/`, no empty segments, no trailing `/`.
pub fn join_key(base: &str, key: &str) -> String {
    let segments: Vec<&str> = base
        .split('/')
        .chain(key.split('/'))
        .filter(|s| !s.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

/// True if `key` is `prefix` itself or lives beneath it.
pub(crate) fn is_under(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key_normalizes() {
        assert_eq!(join_key("/", ""), "/");
        assert_eq!(join_key("/app", "host"), "/app/host");
        assert_eq!(join_key("app/", "/db//host/"), "/app/db/host");
        assert_eq!(join_key("", "/x"), "/x");
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/app/host", "/app"));
        assert!(is_under("/app", "/app"));
        assert!(is_under("/app/host", "/app/"));
        assert!(!is_under("/application", "/app"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn test_classification() {
        assert!(StoreError::WatchTimeout {
            prefix: "/app".into()
        }
        .is_watch_timeout());
        assert!(StoreError::Status {
            url: "u".into(),
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!StoreError::Status {
            url: "u".into(),
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!StoreError::Stopped.is_retryable());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let config = StoreConfig {
            backend: "zookeeper".into(),
            etcd: EtcdConfig::default(),
        };
        assert!(matches!(
            new_client(&config),
            Err(ConfigError::UnknownStore(name)) if name == "zookeeper"
        ));
    }
}
