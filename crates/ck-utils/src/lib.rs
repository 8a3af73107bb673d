//! Logging setup, on-disk helpers and reason strings used across the Chimekeep crates.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a log filter directive.
pub const LOG_ENV_VAR: &str = "CHIMEKEEP_LOG";

pub type UtilsResult<T> = Result<T, UtilsError>;

#[derive(Debug, Error)]
pub enum UtilsError {
    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The global subscriber was already set.
    #[error("logging error: {0}")]
    Logging(String),
    /// Bad filter directive.
    #[error("invalid log filter: {0}")]
    Parse(String),
}

/// Install the global fmt subscriber writing to stderr.
///
/// `CHIMEKEEP_LOG` overrides `default_directive` when set.
pub fn init_logging(default_directive: &str) -> UtilsResult<()> {
    let filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|err| UtilsError::Parse(err.to_string()))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| UtilsError::Logging(err.to_string()))
}

/// Advisory lock on `<file>.lock`, shared between processes. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until no other holder of the lock for `target` remains.
    pub fn exclusive(target: &Path) -> UtilsResult<Self> {
        let file = open_lock_file(target)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    /// Block until no exclusive holder remains; readers may overlap.
    pub fn shared(target: &Path) -> UtilsResult<Self> {
        let file = open_lock_file(target)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Path of the lock file guarding `target`.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

fn open_lock_file(target: &Path) -> UtilsResult<File> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(target))?;
    Ok(file)
}

/// Replace `target` with `contents` through a uniquely named sibling temp file.
pub fn write_atomic(target: &Path, contents: &[u8]) -> UtilsResult<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|err| UtilsError::Io(err.error))?;
    Ok(())
}

/// Reason attached to a fallback alarm armed after a dismissal.
pub fn fallback_reason(reason: &str) -> String {
    wrap_reason("delete_fallback", reason)
}

/// Nest a diagnostic reason under `label`, e.g. `edit(user)`.
pub fn wrap_reason(label: &str, reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        label.to_string()
    } else {
        format!("{label}({reason})")
    }
}
