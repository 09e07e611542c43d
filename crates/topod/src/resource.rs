//! Template resources: one managed destination file each.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::cache::KeyValueCache;
use crate::config::Config;
use crate::error::{ConfigError, ProcessError};
use crate::render::{Renderer, StagedFile};
use crate::store::{join_key, StoreClient};
use crate::sync::{self, FilePolicy, SyncOutcome};

/// A `conf.d/*.toml` file as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Declaration {
    /// Template file, relative to the template directory.
    pub src: String,
    pub dest: PathBuf,
    /// Keys to fetch, relative to `prefix`.
    pub keys: Vec<String>,
    pub prefix: String,
    pub mode: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub check_cmd: Option<String>,
    pub reload_cmd: Option<String>,
    pub backup: bool,
    #[serde(rename = "backupdir")]
    pub backup_dir: Option<PathBuf>,
}

impl Declaration {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

pub struct TemplateResource {
    src: PathBuf,
    /// Absolute store prefix, global prefix included.
    prefix: String,
    keys: Vec<String>,
    policy: FilePolicy,
    last_index: AtomicU64,
    cache: Arc<KeyValueCache>,
    renderer: Renderer,
    store: Arc<dyn StoreClient>,
}

impl std::fmt::Debug for TemplateResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateResource")
            .field("src", &self.src)
            .field("prefix", &self.prefix)
            .field("keys", &self.keys)
            .field("policy", &self.policy)
            .field("last_index", &self.last_index())
            .finish()
    }
}

impl TemplateResource {
    /// Loads the declaration at `path` and binds it to `config`.
    pub fn new(path: &Path, config: &Config) -> Result<Self, ConfigError> {
        let store = config.store_client()?;
        log::debug!("Loading template resource {}", path.display());
        let decl = Declaration::from_file(path)?;
        Self::from_declaration(decl, path, config, store)
    }

    pub fn from_declaration(
        decl: Declaration,
        path: &Path,
        config: &Config,
        store: Arc<dyn StoreClient>,
    ) -> Result<Self, ConfigError> {
        if decl.src.trim().is_empty() {
            return Err(ConfigError::EmptySource {
                path: path.to_path_buf(),
            });
        }
        if decl.dest.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("{}: dest is required", path.display()),
            });
        }

        let backup_dir = match (decl.backup, decl.backup_dir) {
            (false, _) => None,
            (true, Some(dir)) => Some(dir),
            (true, None) => Some(
                decl.dest
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
            ),
        };

        let cache = Arc::new(KeyValueCache::new());
        let renderer = Renderer::new(cache.clone());

        Ok(Self {
            src: config.template_dir.join(&decl.src),
            prefix: join_key(&config.prefix, &decl.prefix),
            keys: decl.keys,
            policy: FilePolicy {
                dest: decl.dest,
                mode: decl.mode,
                uid: decl.uid,
                gid: decl.gid,
                check_cmd: decl.check_cmd.filter(|c| !c.trim().is_empty()),
                reload_cmd: decl.reload_cmd.filter(|c| !c.trim().is_empty()),
                backup_dir,
                noop: config.noop,
                keep_staged: config.keep_staged,
            },
            last_index: AtomicU64::new(0),
            cache,
            renderer,
            store,
        })
    }

    pub fn src(&self) -> &Path {
        &self.src
    }

    pub fn dest(&self) -> &Path {
        &self.policy.dest
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn policy(&self) -> &FilePolicy {
        &self.policy
    }

    pub fn cache(&self) -> &KeyValueCache {
        &self.cache
    }

    /// Last store index this resource acted on. Zero means no baseline yet.
    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }

    /// Records `index` as seen. Returns false if it is not newer than the
    /// last one; the stored index never moves backwards.
    pub fn advance_index(&self, index: u64) -> bool {
        self.last_index.fetch_max(index, Ordering::SeqCst) < index
    }

    /// Store keys this resource fetches, prefix applied.
    pub fn store_keys(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| join_key(&self.prefix, k))
            .collect()
    }

    /// Rebuilds the cache from the store. On failure the cache keeps its
    /// previous snapshot.
    pub fn refresh(&self) -> Result<(), ProcessError> {
        log::debug!("Retrieving keys from store, key prefix: {}", self.prefix);
        let values = self
            .store
            .get_values(&self.store_keys())
            .map_err(|source| ProcessError::StoreFetch {
                prefix: self.prefix.clone(),
                source,
            })?;

        let prefix = self.prefix.as_str();
        self.cache.replace_all(values.into_iter().map(|(k, v)| {
            let relative = k.strip_prefix(prefix).unwrap_or(&k);
            (join_key("/", relative), v)
        }));
        log::debug!("Cached {} keys for {}", self.cache.len(), self.src.display());
        Ok(())
    }

    /// Resolves the mode, refreshes the cache and renders a staged file.
    pub fn stage(&self) -> Result<(u32, StagedFile), ProcessError> {
        let mode = sync::effective_mode(&self.policy)?;
        self.refresh()?;
        let staged = self.renderer.render(
            &self.src,
            &self.policy.dest,
            mode,
            self.policy.uid,
            self.policy.gid,
        )?;
        Ok((mode, staged))
    }

    /// Runs one full cycle: mode, fetch, render, sync.
    pub fn process(&self) -> Result<SyncOutcome, ProcessError> {
        let (mode, staged) = self.stage()?;
        sync::sync(&self.policy, mode, staged)
    }
}

/// Loads every `*.toml` declaration under `config.conf_dir`, in path order.
/// Any bad declaration fails the whole discovery.
pub fn discover(config: &Config) -> Result<Vec<TemplateResource>, ConfigError> {
    log::debug!(
        "Loading template resources from {}",
        config.conf_dir.display()
    );
    if !config.conf_dir.is_dir() {
        return Err(ConfigError::ConfDirNotFound(config.conf_dir.clone()));
    }

    let pattern = config.conf_dir.join("*.toml");
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .collect();
    paths.sort();

    let resources = paths
        .iter()
        .map(|path| TemplateResource::new(path, config))
        .collect::<Result<Vec<_>, _>>()?;
    log::info!("Loaded {} template resources", resources.len());
    Ok(resources)
}
