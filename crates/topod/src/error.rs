use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TopodError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Failed to start processor thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Processor thread panicked")]
    Panicked,
}

/// Errors detected while assembling the agent. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("A valid store client is required")]
    MissingStoreClient,

    #[error("Empty template source in '{path}'")]
    EmptySource { path: PathBuf },

    #[error("Config directory not found: {0}")]
    ConfDirNotFound(PathBuf),

    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML in '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid declaration pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown store backend: {0}")]
    UnknownStore(String),

    #[error("Invalid store node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("Failed to load TLS material '{path}': {reason}")]
    Tls { path: PathBuf, reason: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors that abort a single resource cycle. Other resources keep running.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to fetch keys under '{prefix}': {source}")]
    StoreFetch {
        prefix: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to watch prefix '{prefix}': {source}")]
    StoreWatch {
        prefix: String,
        #[source]
        source: StoreError,
    },

    #[error("Missing template {0}")]
    MissingTemplate(PathBuf),

    #[error("Failed to render template '{path}': {reason}")]
    Render { path: PathBuf, reason: String },

    #[error("Failed to stage '{path}': {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file mode '{mode}': {reason}")]
    InvalidMode { mode: String, reason: String },

    #[error("Failed to stat '{path}': {reason}")]
    Stat { path: PathBuf, reason: String },

    #[error("Config check failed for '{command}': {output}")]
    ValidationFailed { command: String, output: String },

    #[error("Reload command '{command}' failed: {output}")]
    ReloadFailed { command: String, output: String },

    #[error("Failed to run '{command}': {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace '{to}' with '{from}': {source}")]
    Replace {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Rename to '{path}' failed and writing in place failed too: {source}")]
    RenameFallback {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Returns true if the same cycle may succeed when attempted again without
    /// any configuration change.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::StoreFetch { source, .. } | ProcessError::StoreWatch { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TopodError>;
