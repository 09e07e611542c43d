//! Builder for resource declaration files.

#![allow(dead_code)]

use std::path::Path;

/// Builds the TOML text of a `conf.d` declaration.
pub struct DeclarationBuilder {
    src: String,
    dest: String,
    prefix: Option<String>,
    keys: Vec<String>,
    mode: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    check_cmd: Option<String>,
    reload_cmd: Option<String>,
    backup: bool,
    backup_dir: Option<String>,
}

impl DeclarationBuilder {
    pub fn new(src: &str, dest: &Path) -> Self {
        Self {
            src: src.to_string(),
            dest: dest.display().to_string(),
            prefix: None,
            keys: vec![],
            mode: None,
            uid: None,
            gid: None,
            check_cmd: None,
            reload_cmd: None,
            backup: false,
            backup_dir: None,
        }
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.keys.push(key.to_string());
        self
    }

    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn check_cmd(mut self, cmd: &str) -> Self {
        self.check_cmd = Some(cmd.to_string());
        self
    }

    pub fn reload_cmd(mut self, cmd: &str) -> Self {
        self.reload_cmd = Some(cmd.to_string());
        self
    }

    pub fn backup_to(mut self, dir: &Path) -> Self {
        self.backup = true;
        self.backup_dir = Some(dir.display().to_string());
        self
    }

    pub fn to_toml(&self) -> String {
        let mut out = format!("src = {:?}\ndest = {:?}\n", self.src, self.dest);
        if let Some(prefix) = &self.prefix {
            out.push_str(&format!("prefix = {:?}\n", prefix));
        }
        let keys: Vec<String> = self.keys.iter().map(|k| format!("{:?}", k)).collect();
        out.push_str(&format!("keys = [{}]\n", keys.join(", ")));
        if let Some(mode) = &self.mode {
            out.push_str(&format!("mode = {:?}\n", mode));
        }
        if let Some(uid) = self.uid {
            out.push_str(&format!("uid = {}\n", uid));
        }
        if let Some(gid) = self.gid {
            out.push_str(&format!("gid = {}\n", gid));
        }
        if let Some(cmd) = &self.check_cmd {
            out.push_str(&format!("check_cmd = {:?}\n", cmd));
        }
        if let Some(cmd) = &self.reload_cmd {
            out.push_str(&format!("reload_cmd = {:?}\n", cmd));
        }
        if self.backup {
            out.push_str("backup = true\n");
        }
        if let Some(dir) = &self.backup_dir {
            out.push_str(&format!("backupdir = {:?}\n", dir));
        }
        out
    }
}
