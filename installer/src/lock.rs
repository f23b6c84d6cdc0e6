//! Advisory lock serialising installer runs.
//!
//! The lock is an exclusive `flock` on a lock file, so it is released with
//! the descriptor: a lock file left behind by a crashed run is simply
//! reacquired. The holder's PID is written into the file for diagnostics.

use crate::error::{InstallerError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};

/// Lock file used when none is configured.
pub const DEFAULT_LOCK_PATH: &str = "/run/kmodsmith-installer.lock";

/// Exclusive hold on the install lock, released on drop.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: Utf8PathBuf,
}

impl InstallLock {
    /// Acquire the lock at `path` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::LockHeld`] when another process holds the
    /// lock, or an I/O error when the lock file cannot be opened.
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(InstallerError::LockHeld {
                    path: path.to_owned(),
                });
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        log::debug!("acquired install lock {path}");
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!("unable to release install lock {}: {err}", self.path);
        }
    }
}
