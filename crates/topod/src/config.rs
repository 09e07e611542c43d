//! Agent configuration.
//!
//! [`AgentConfig`] is what the operator writes in `topod.toml`; [`Config`] is
//! the resolved view handed to processors and template resources.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::store::{EtcdConfig, StoreClient, StoreConfig};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/topod/topod.toml";
pub const DEFAULT_CONF_DIR: &str = "/etc/topod";

/// Settings shared by every template resource.
#[derive(Clone)]
pub struct Config {
    pub parent_dir: PathBuf,
    /// Directory scanned for `*.toml` resource declarations.
    pub conf_dir: PathBuf,
    /// Directory template sources are resolved against.
    pub template_dir: PathBuf,
    /// Prepended to every resource prefix.
    pub prefix: String,
    pub noop: bool,
    pub keep_staged: bool,
    pub store_client: Option<Arc<dyn StoreClient>>,
}

impl Config {
    /// Lays out `conf.d/` and `templates/` under `parent_dir`.
    pub fn new(parent_dir: impl Into<PathBuf>, store_client: Arc<dyn StoreClient>) -> Self {
        let parent_dir = parent_dir.into();
        Self {
            conf_dir: parent_dir.join("conf.d"),
            template_dir: parent_dir.join("templates"),
            parent_dir,
            prefix: "/".to_string(),
            noop: false,
            keep_staged: false,
            store_client: Some(store_client),
        }
    }

    pub fn store_client(&self) -> Result<Arc<dyn StoreClient>, ConfigError> {
        self.store_client
            .clone()
            .ok_or(ConfigError::MissingStoreClient)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("parent_dir", &self.parent_dir)
            .field("conf_dir", &self.conf_dir)
            .field("template_dir", &self.template_dir)
            .field("prefix", &self.prefix)
            .field("noop", &self.noop)
            .field("keep_staged", &self.keep_staged)
            .field("store_client", &self.store_client.is_some())
            .finish()
    }
}

/// Contents of `topod.toml`. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub store: String,
    pub nodes: Vec<String>,
    pub scheme: String,
    pub confdir: PathBuf,
    pub prefix: String,
    pub watch: bool,
    /// Seconds between rounds in interval mode.
    pub interval: u64,
    pub onetime: bool,
    pub noop: bool,
    pub keep_stage_file: bool,
    pub debug: bool,
    pub verbose: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub client_cacert: Option<PathBuf>,
    /// Seconds a single long-poll may stay open.
    pub watch_timeout: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            store: "etcd".to_string(),
            nodes: vec!["127.0.0.1:4001".to_string()],
            scheme: "http".to_string(),
            confdir: PathBuf::from(DEFAULT_CONF_DIR),
            prefix: "/".to_string(),
            watch: false,
            interval: 60,
            onetime: false,
            noop: false,
            keep_stage_file: false,
            debug: false,
            verbose: false,
            client_cert: None,
            client_key: None,
            client_cacert: None,
            watch_timeout: 300,
        }
    }
}

impl AgentConfig {
    /// Loads `path`, or returns defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        load_config(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Validation {
                message: "at least one store node is required".to_string(),
            });
        }
        if !self.watch && !self.onetime && self.interval == 0 {
            return Err(ConfigError::Validation {
                message: "interval must be greater than zero".to_string(),
            });
        }
        if self.watch_timeout == 0 {
            return Err(ConfigError::Validation {
                message: "watch_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            backend: self.store.clone(),
            etcd: EtcdConfig {
                nodes: self.nodes.clone(),
                scheme: self.scheme.clone(),
                client_cert: self.client_cert.clone(),
                client_key: self.client_key.clone(),
                client_cacert: self.client_cacert.clone(),
                watch_timeout: Duration::from_secs(self.watch_timeout),
                ..EtcdConfig::default()
            },
        }
    }

    pub fn template_config(&self, store_client: Arc<dyn StoreClient>) -> Config {
        Config {
            prefix: self.prefix.clone(),
            noop: self.noop,
            keep_staged: self.keep_stage_file,
            ..Config::new(&self.confdir, store_client)
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AgentConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_config(&content, path)
}

pub fn load_config_from_str(content: &str) -> Result<AgentConfig, ConfigError> {
    parse_config(content, Path::new("<inline>"))
}

fn parse_config(content: &str, path: &Path) -> Result<AgentConfig, ConfigError> {
    let config: AgentConfig = toml::from_str(content).map_err(|e| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source: e,
    })?;

    config.validate()?;

    Ok(config)
}
