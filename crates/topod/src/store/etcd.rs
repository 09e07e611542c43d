//! etcd v2 keys API backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver};
use reqwest::blocking::{Client, ClientBuilder, Response};
use serde::Deserialize;

use super::{join_key, StoreClient, StoreError, StoreNode};
use crate::error::ConfigError;

const INDEX_HEADER: &str = "X-Etcd-Index";
const ERROR_KEY_NOT_FOUND: u64 = 100;
const ERROR_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// `host:port` or full URLs.
    pub nodes: Vec<String>,
    /// Scheme applied to nodes given without one.
    pub scheme: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub client_cacert: Option<PathBuf>,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    /// Upper bound for a single long-poll before it is re-issued.
    pub watch_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["127.0.0.1:4001".to_string()],
            scheme: "http".to_string(),
            client_cert: None,
            client_key: None,
            client_cacert: None,
            dial_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            watch_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct EtcdClient {
    endpoints: Arc<[String]>,
    client: Client,
    watch_client: Client,
}

impl EtcdClient {
    pub fn new(config: EtcdConfig) -> Result<Self, ConfigError> {
        let endpoints = config
            .nodes
            .iter()
            .map(|node| endpoint(node, &config.scheme))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ConfigError::Validation {
                message: "at least one etcd node is required".to_string(),
            });
        }

        let client = builder(&config)?
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        let watch_client = builder(&config)?
            .timeout(config.watch_timeout)
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            endpoints: endpoints.into(),
            client,
            watch_client,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Sends a GET for `key`, trying each node in turn while connections fail.
    fn send(
        &self,
        client: &Client,
        key: &str,
        query: &[(&str, &str)],
    ) -> Result<(String, Response), StoreError> {
        let mut last_error = String::new();
        for endpoint in self.endpoints.iter() {
            let url = keys_url(endpoint, key);
            match client.get(&url).query(query).send() {
                Ok(resp) => return Ok((url, resp)),
                Err(e) if e.is_connect() => {
                    log::debug!("etcd node {} unreachable: {}", endpoint, e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(StoreError::Request { url, source: e }),
            }
        }
        Err(StoreError::Unreachable {
            nodes: self.endpoints.join(", "),
            reason: last_error,
        })
    }

    fn fetch(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let (url, resp) = self.send(
            &self.client,
            key,
            &[("recursive", "true"), ("sorted", "true")],
        )?;
        match read_reply(&url, resp)? {
            Reply::Keys { body, .. } => Ok(body
                .node
                .map(|node| StoreNode::from(node).flatten())
                .unwrap_or_default()),
            Reply::Error { body, .. } if body.error_code == ERROR_KEY_NOT_FOUND => {
                log::debug!("Key {} not found in store", key);
                Ok(HashMap::new())
            }
            Reply::Error { status, body, .. } => Err(body.into_error(url, status)),
        }
    }

    fn current_index(&self, prefix: &str) -> Result<u64, StoreError> {
        let (url, resp) = self.send(&self.client, prefix, &[])?;
        match read_reply(&url, resp)? {
            Reply::Keys { index, .. } => baseline_index(&url, index),
            Reply::Error { index, body, .. } if body.error_code == ERROR_KEY_NOT_FOUND => {
                baseline_index(&url, Some(index))
            }
            Reply::Error { status, body, .. } => Err(body.into_error(url, status)),
        }
    }

    fn wait_for_change(&self, prefix: &str, wait_index: u64) -> Result<u64, StoreError> {
        let next = (wait_index + 1).to_string();
        let query = [
            ("wait", "true"),
            ("recursive", "true"),
            ("waitIndex", next.as_str()),
        ];
        let timeout = || StoreError::WatchTimeout {
            prefix: prefix.to_string(),
        };

        let (url, resp) = match self.send(&self.watch_client, prefix, &query) {
            Err(StoreError::Request { source, .. }) if source.is_timeout() => return Err(timeout()),
            other => other?,
        };
        let status = resp.status().as_u16();
        let header_index = header_index(&resp);
        let text = match resp.text() {
            Ok(text) => text,
            Err(e) if e.is_timeout() || e.is_body() => return Err(timeout()),
            Err(e) => return Err(StoreError::Request { url, source: e }),
        };
        // etcd ends an expired long-poll with an empty body
        if text.trim().is_empty() {
            return Err(timeout());
        }

        match parse_reply(&url, status, header_index, &text)? {
            Reply::Keys { index, body } => Ok(body
                .node
                .map(|node| node.modified_index)
                .filter(|modified| *modified > wait_index)
                .unwrap_or_else(|| index.unwrap_or(0).max(wait_index + 1))),
            Reply::Error { index, body, .. } if body.error_code == ERROR_INDEX_CLEARED => {
                log::warn!(
                    "Watch index {} on {} was cleared, resyncing at {}",
                    wait_index,
                    prefix,
                    index
                );
                Ok(index.max(wait_index + 1))
            }
            Reply::Error { status, body, .. } => Err(body.into_error(url, status)),
        }
    }
}

impl StoreClient for EtcdClient {
    fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let results: Vec<Result<HashMap<String, String>, StoreError>> = thread::scope(|scope| {
            let handles: Vec<_> = keys
                .iter()
                .map(|key| scope.spawn(move || self.fetch(key)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });

        let mut values = HashMap::new();
        for result in results {
            values.extend(result?);
        }
        Ok(values)
    }

    fn watch_prefix(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &Receiver<()>,
    ) -> Result<u64, StoreError> {
        if wait_index == 0 {
            return self.current_index(prefix);
        }

        let (tx, rx) = bounded(1);
        let this = self.clone();
        let owned_prefix = prefix.to_string();
        thread::spawn(move || {
            // the receiver is gone if the watch was stopped meanwhile
            let _ = tx.send(this.wait_for_change(&owned_prefix, wait_index));
        });

        select! {
            recv(rx) -> result => result.unwrap_or_else(|_| Err(StoreError::Unreachable {
                nodes: self.endpoints.join(", "),
                reason: "watch worker exited".to_string(),
            })),
            recv(stop) -> _ => Err(StoreError::Stopped),
        }
    }
}

fn builder(config: &EtcdConfig) -> Result<ClientBuilder, ConfigError> {
    let mut builder = Client::builder().connect_timeout(config.dial_timeout);

    if let Some(ca_path) = &config.client_cacert {
        let pem = read_pem(ca_path)?;
        let ca = reqwest::Certificate::from_pem(&pem).map_err(|e| ConfigError::Tls {
            path: ca_path.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.add_root_certificate(ca);
    }

    match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let mut pem = read_pem(cert_path)?;
            pem.extend_from_slice(b"\n");
            pem.extend(read_pem(key_path)?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| ConfigError::Tls {
                path: cert_path.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        (Some(path), None) | (None, Some(path)) => {
            return Err(ConfigError::Tls {
                path: path.clone(),
                reason: "client certificate and key must be given together".to_string(),
            });
        }
    }

    Ok(builder)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

fn endpoint(node: &str, scheme: &str) -> Result<String, ConfigError> {
    let node = node.trim();
    if node.is_empty() {
        return Err(ConfigError::InvalidNode {
            node: node.to_string(),
            reason: "empty node address".to_string(),
        });
    }
    let url = if node.contains("://") {
        node.to_string()
    } else {
        format!("{}://{}", scheme, node)
    };
    reqwest::Url::parse(&url).map_err(|e| ConfigError::InvalidNode {
        node: node.to_string(),
        reason: e.to_string(),
    })?;
    Ok(url.trim_end_matches('/').to_string())
}

fn keys_url(endpoint: &str, key: &str) -> String {
    format!("{}/v2/keys{}", endpoint, join_key("/", key))
}

fn header_index(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// A baseline read must carry a usable index, otherwise every watch would
/// start over from nothing.
fn baseline_index(url: &str, index: Option<u64>) -> Result<u64, StoreError> {
    match index {
        Some(index) if index > 0 => Ok(index),
        _ => Err(StoreError::Decode {
            url: url.to_string(),
            reason: format!("missing or invalid {} header", INDEX_HEADER),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Option<RawNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    #[serde(default)]
    key: String,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    modified_index: u64,
}

impl From<RawNode> for StoreNode {
    fn from(raw: RawNode) -> Self {
        let key = if raw.key.is_empty() {
            "/".to_string()
        } else {
            raw.key
        };
        if raw.dir {
            StoreNode::Dir {
                key,
                nodes: raw.nodes.into_iter().map(StoreNode::from).collect(),
            }
        } else {
            StoreNode::Leaf {
                key,
                value: raw.value.unwrap_or_default(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl ErrorBody {
    fn into_error(self, url: String, status: u16) -> StoreError {
        StoreError::Status {
            url,
            status,
            message: format!("{} (code {}) {}", self.message, self.error_code, self.cause)
                .trim_end()
                .to_string(),
        }
    }
}

#[derive(Debug)]
enum Reply {
    Keys {
        index: Option<u64>,
        body: KeysResponse,
    },
    Error {
        index: u64,
        status: u16,
        body: ErrorBody,
    },
}

fn read_reply(url: &str, resp: Response) -> Result<Reply, StoreError> {
    let status = resp.status().as_u16();
    let index = header_index(&resp);
    let text = resp.text().map_err(|e| StoreError::Request {
        url: url.to_string(),
        source: e,
    })?;
    parse_reply(url, status, index, &text)
}

fn parse_reply(
    url: &str,
    status: u16,
    header_index: Option<u64>,
    text: &str,
) -> Result<Reply, StoreError> {
    if (200..300).contains(&status) {
        let body: KeysResponse = serde_json::from_str(text).map_err(|e| StoreError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(Reply::Keys {
            index: header_index,
            body,
        });
    }

    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => Ok(Reply::Error {
            index: header_index.unwrap_or(0).max(body.index),
            status,
            body,
        }),
        Err(_) => Err(StoreError::Status {
            url: url.to_string(),
            status,
            message: text.trim().to_string(),
        }),
    }
}
