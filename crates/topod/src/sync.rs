//! Promotion of a staged render to its destination.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{Local, SecondsFormat};
use handlebars::Handlebars;
use sha2::{Digest, Sha256};

use crate::error::ProcessError;
use crate::render::StagedFile;

pub const DEFAULT_MODE: u32 = 0o644;

/// How a destination file is written and what runs around the write.
#[derive(Debug, Clone, Default)]
pub struct FilePolicy {
    pub dest: PathBuf,
    /// Octal permission string; unset inherits from the destination.
    pub mode: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Run against the staged file before promotion; `{{src}}` is its path.
    pub check_cmd: Option<String>,
    pub reload_cmd: Option<String>,
    /// Where the previous destination is moved before replacement. `None`
    /// disables backups.
    pub backup_dir: Option<PathBuf>,
    pub noop: bool,
    pub keep_staged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Destination already matches the render.
    InSync,
    /// Destination differs but noop mode left it alone.
    Pending,
    Updated,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::InSync => write!(f, "in sync"),
            SyncOutcome::Pending => write!(f, "pending"),
            SyncOutcome::Updated => write!(f, "updated"),
        }
    }
}

pub fn parse_mode(mode: &str) -> Result<u32, ProcessError> {
    let invalid = |reason: String| ProcessError::InvalidMode {
        mode: mode.to_string(),
        reason,
    };
    let trimmed = mode.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        u32::from_str_radix(trimmed.strip_prefix("0o").unwrap_or(trimmed), 8)
    }
    .map_err(|e| invalid(e.to_string()))?;

    if parsed > 0o7777 {
        return Err(invalid("not a permission value".to_string()));
    }
    Ok(parsed)
}

/// Mode the destination should end up with.
pub fn effective_mode(policy: &FilePolicy) -> Result<u32, ProcessError> {
    match &policy.mode {
        Some(mode) if !mode.trim().is_empty() => parse_mode(mode),
        _ => match fs::metadata(&policy.dest) {
            Ok(meta) => Ok(permission_bits(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DEFAULT_MODE),
            Err(e) => Err(ProcessError::Stat {
                path: policy.dest.clone(),
                reason: e.to_string(),
            }),
        },
    }
}

/// Ownership, permissions and content digest of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub digest: String,
}

pub fn fingerprint(path: &Path) -> Result<Fingerprint, ProcessError> {
    let stat_err = |reason: String| ProcessError::Stat {
        path: path.to_path_buf(),
        reason,
    };
    let mut file = File::open(path).map_err(|e| stat_err(e.to_string()))?;
    let meta = file.metadata().map_err(|e| stat_err(e.to_string()))?;
    let (uid, gid) = ownership(&meta).ok_or_else(|| {
        stat_err("file ownership is not available on this platform".to_string())
    })?;

    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| stat_err(e.to_string()))?;

    Ok(Fingerprint {
        uid,
        gid,
        mode: permission_bits(&meta),
        digest: hex::encode(hasher.finalize()),
    })
}

/// True if `candidate` and `target` agree on owner, group, mode and content.
pub fn files_equivalent(candidate: &Path, target: &Path) -> Result<bool, ProcessError> {
    let want = fingerprint(candidate)?;
    let have = fingerprint(target)?;
    let target = target.display();

    if want.uid != have.uid {
        log::info!("{} has UID {} which should be {}", target, have.uid, want.uid);
    }
    if want.gid != have.gid {
        log::info!("{} has GID {} which should be {}", target, have.gid, want.gid);
    }
    if want.mode != have.mode {
        log::info!(
            "{} has mode {:o} which should be {:o}",
            target,
            have.mode,
            want.mode
        );
    }
    if want.digest != have.digest {
        log::info!(
            "{} has sha256 {} which should be {}",
            target,
            have.digest,
            want.digest
        );
    }
    Ok(want == have)
}

/// Promotes `staged` to `policy.dest` if it differs, running the check and
/// reload commands around the replacement.
pub fn sync(
    policy: &FilePolicy,
    mode: u32,
    staged: StagedFile,
) -> Result<SyncOutcome, ProcessError> {
    let staged_path = staged.path().to_path_buf();
    // the guard deletes the staged file on every return path below
    let _guard = if policy.keep_staged {
        log::info!("Keeping staged file: {}", staged_path.display());
        staged
            .into_temp_path()
            .keep()
            .map_err(|e| ProcessError::Stage {
                path: staged_path.clone(),
                source: e.error,
            })?;
        None
    } else {
        Some(staged)
    };

    let dest = &policy.dest;
    log::debug!("Comparing candidate config to {}", dest.display());
    let equivalent = files_equivalent(&staged_path, dest).unwrap_or_else(|e| {
        log::debug!("{}", e);
        false
    });
    if equivalent {
        log::info!("Target config {} in sync", dest.display());
        return Ok(SyncOutcome::InSync);
    }

    if policy.noop {
        log::warn!(
            "Noop mode enabled, {} will not be modified",
            dest.display()
        );
        return Ok(SyncOutcome::Pending);
    }

    log::info!("Target config {} out of sync", dest.display());
    if let Some(check_cmd) = &policy.check_cmd {
        check(check_cmd, &staged_path)?;
    }

    if let Some(backup_dir) = &policy.backup_dir {
        match backup(dest, backup_dir) {
            Ok(Some(path)) => {
                log::info!("Backed up {} to {}", dest.display(), path.display())
            }
            Ok(None) => log::debug!("Nothing to back up at {}", dest.display()),
            Err(e) => log::warn!(
                "Backup of {} to {} failed: {}",
                dest.display(),
                backup_dir.display(),
                e
            ),
        }
    }

    log::debug!("Overwriting target config {}", dest.display());
    replace_destination(&staged_path, dest, mode, policy.uid, policy.gid, |from, to| {
        fs::rename(from, to)
    })?;

    if let Some(reload_cmd) = &policy.reload_cmd {
        reload(reload_cmd)?;
    }

    log::info!("Target config {} has been updated", dest.display());
    Ok(SyncOutcome::Updated)
}

/// Renames `staged` over `dest`. When the rename is refused because the
/// destination is a mount point, the content is written in place instead.
pub fn replace_destination<F>(
    staged: &Path,
    dest: &Path,
    mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
    rename: F,
) -> Result<(), ProcessError>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match rename(staged, dest) {
        Ok(()) => Ok(()),
        Err(e) if is_busy_mount(&e) => {
            log::debug!(
                "Rename to {} failed ({}), target is likely a mount. Writing in place instead",
                dest.display(),
                e
            );
            write_in_place(staged, dest, mode, uid, gid).map_err(|source| {
                ProcessError::RenameFallback {
                    path: dest.to_path_buf(),
                    source,
                }
            })
        }
        Err(source) => Err(ProcessError::Replace {
            from: staged.to_path_buf(),
            to: dest.to_path_buf(),
            source,
        }),
    }
}

fn is_busy_mount(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::CrossesDevices
    )
}

fn write_in_place(
    staged: &Path,
    dest: &Path,
    mode: u32,
    uid: Option<u32>,
    gid: Option<u32>,
) -> io::Result<()> {
    let contents = fs::read(staged)?;
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(dest)?;
    file.write_all(&contents)?;
    file.sync_all()?;
    // an existing file keeps its old mode through open()
    apply_mode(dest, mode)?;
    apply_owner(dest, uid, gid)
}

/// Moves `dest` to `<backup_dir>/<basename><timestamp>`. Returns `None` when
/// there is no destination yet.
fn backup(dest: &Path, backup_dir: &Path) -> io::Result<Option<PathBuf>> {
    if !dest.exists() {
        return Ok(None);
    }
    let name = dest
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?
        .to_string_lossy();
    let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Nanos, false);
    let target = backup_dir.join(format!("{}{}", name, stamp));
    fs::rename(dest, &target)?;
    Ok(Some(target))
}

/// Runs the check command against the staged file.
fn check(template: &str, staged: &Path) -> Result<(), ProcessError> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    let command = registry
        .render_template(
            template,
            &serde_json::json!({ "src": staged.to_string_lossy() }),
        )
        .map_err(|e| ProcessError::ValidationFailed {
            command: template.to_string(),
            output: format!("invalid command template: {}", e),
        })?;

    let (success, output) = run_shell(&command)?;
    if !success {
        return Err(ProcessError::ValidationFailed { command, output });
    }
    Ok(())
}

fn reload(command: &str) -> Result<(), ProcessError> {
    let (success, output) = run_shell(command)?;
    if !success {
        return Err(ProcessError::ReloadFailed {
            command: command.to_string(),
            output,
        });
    }
    Ok(())
}

/// Runs `command` through `/bin/sh -c`, returning success and combined output.
fn run_shell(command: &str) -> Result<(bool, String), ProcessError> {
    log::debug!("Running {}", command);
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|source| ProcessError::Command {
            command: command.to_string(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    log::debug!("{:?}", combined);
    Ok((output.status.success(), combined))
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        DEFAULT_MODE
    }
}

#[cfg(unix)]
fn ownership(meta: &fs::Metadata) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
fn ownership(_meta: &fs::Metadata) -> Option<(u32, u32)> {
    None
}

#[cfg(unix)]
pub(crate) fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn apply_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    std::os::unix::fs::chown(path, uid, gid)
}

#[cfg(not(unix))]
pub(crate) fn apply_owner(_path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
    Ok(())
}
