//! Test harness for isolated test execution.
//!
//! `TestHarness` lays out a throwaway config directory (`conf.d/`,
//! `templates/`), a destination directory and an in-memory store, and hands
//! out a `Config` bound to them.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use topod::store::MemoryStore;
use topod::Config;

use super::builders::DeclarationBuilder;

pub struct TestHarness {
    temp_dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub config: Config,
    /// Where destination files are written.
    pub dest_dir: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(MemoryStore::new());
        let config = Config::new(temp_dir.path().join("etc"), store.clone());
        let dest_dir = temp_dir.path().join("dest");

        std::fs::create_dir_all(&config.conf_dir).expect("Failed to create conf.d");
        std::fs::create_dir_all(&config.template_dir).expect("Failed to create templates");
        std::fs::create_dir_all(&dest_dir).expect("Failed to create dest dir");

        Self {
            temp_dir,
            store,
            config,
            dest_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn dest(&self, name: &str) -> PathBuf {
        self.dest_dir.join(name)
    }

    pub fn write_template(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.template_dir.join(name);
        std::fs::write(&path, content).expect("Failed to write template");
        path
    }

    pub fn declare(&self, name: &str, declaration: &DeclarationBuilder) -> PathBuf {
        let path = self.config.conf_dir.join(format!("{}.toml", name));
        std::fs::write(&path, declaration.to_toml()).expect("Failed to write declaration");
        path
    }

    /// Creates a fresh directory under the harness root.
    pub fn mkdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create directory");
        path
    }

    /// Owner and group of files this test process creates.
    #[cfg(unix)]
    pub fn own_ids(&self) -> (u32, u32) {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(self.temp_dir.path()).expect("Failed to stat temp dir");
        (meta.uid(), meta.gid())
    }

    pub fn read(&self, path: &Path) -> String {
        std::fs::read_to_string(path).expect("Failed to read file")
    }

    /// Names of every entry in `dir`, sorted.
    pub fn list(&self, dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("Failed to read dir")
            .map(|e| {
                e.expect("Failed to read entry")
                    .file_name()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        names.sort();
        names
    }
}
