//! Facts about the target kernel, computed once per run.
//!
//! The kernel release, machine architecture, and proc-version signature are
//! read when the installer starts and passed explicitly to every component
//! that needs them. [`SystemRoot`] anchors every kernel pseudo-file lookup so
//! tests can point the installer at a scratch directory.

use crate::error::{InstallerError, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// Location of the proc-version signature relative to the system root.
const PROC_VERSION: &str = "proc/version";

/// Root directory under which kernel pseudo-files are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRoot(Utf8PathBuf);

impl SystemRoot {
    /// Create a root anchored at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self(path.into())
    }

    /// Resolve a path relative to the root.
    #[must_use]
    pub fn join(&self, relative: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.0.join(relative)
    }

    /// Return the root directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.0
    }

    /// Read a small pseudo-file and return its trimmed contents.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading the file.
    pub fn read_trimmed(&self, relative: impl AsRef<Utf8Path>) -> std::io::Result<String> {
        let contents = std::fs::read_to_string(self.join(relative))?;
        Ok(contents.trim().to_owned())
    }
}

impl Default for SystemRoot {
    fn default() -> Self {
        Self(Utf8PathBuf::from("/"))
    }
}

/// The kernel the installer targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelContext {
    release: String,
    machine: String,
    proc_version: String,
    running: bool,
}

impl KernelContext {
    /// Create a context from known values.
    #[must_use]
    pub fn new(
        release: impl Into<String>,
        machine: impl Into<String>,
        proc_version: impl Into<String>,
    ) -> Self {
        Self {
            release: release.into(),
            machine: machine.into(),
            proc_version: proc_version.into(),
            running: true,
        }
    }

    /// Detect the running kernel, optionally targeting another release.
    ///
    /// When `target_release` names a kernel other than the running one the
    /// returned context is marked as not running, which disables load tests.
    ///
    /// # Errors
    ///
    /// Returns an error when `uname` fails or the proc-version signature
    /// cannot be read.
    pub fn detect(root: &SystemRoot, target_release: Option<&str>) -> Result<Self> {
        let uts = nix::sys::utsname::uname().map_err(|e| InstallerError::ToolNotFound {
            tool: "uname".to_owned(),
            reason: e.desc().to_owned(),
        })?;
        let running_release = uts.release().to_string_lossy().into_owned();
        let machine = uts.machine().to_string_lossy().into_owned();
        let proc_version = root.read_trimmed(PROC_VERSION)?;

        let mut context = Self::new(running_release.clone(), machine, proc_version);
        if let Some(target) = target_release.filter(|t| *t != running_release) {
            log::info!("targeting kernel {target}; the running kernel is {running_release}");
            context.release = target.to_owned();
            context.running = false;
        }
        Ok(context)
    }

    /// Return the kernel release (`uname -r`).
    #[must_use]
    pub fn release(&self) -> &str {
        &self.release
    }

    /// Return the machine hardware name (`uname -m`).
    #[must_use]
    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Return the proc-version signature of the running kernel.
    #[must_use]
    pub fn proc_version(&self) -> &str {
        &self.proc_version
    }

    /// Return true when the target kernel is the one currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Mark the target kernel as different from the running one.
    #[must_use]
    pub fn not_running(mut self) -> Self {
        self.running = false;
        self
    }

    /// Return the kbuild `ARCH` value for the machine.
    #[must_use]
    pub fn kbuild_arch(&self) -> &str {
        match self.machine.as_str() {
            "i386" | "i486" | "i586" | "i686" => "x86",
            "aarch64" => "arm64",
            "ppc64" | "ppc64le" => "powerpc",
            other => other,
        }
    }

    /// Return true on the PowerPC architecture family.
    #[must_use]
    pub fn is_powerpc(&self) -> bool {
        self.kbuild_arch() == "powerpc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("x86_64", "x86_64")]
    #[case("i686", "x86")]
    #[case("aarch64", "arm64")]
    #[case("ppc64le", "powerpc")]
    fn maps_machine_to_kbuild_arch(#[case] machine: &str, #[case] arch: &str) {
        let kernel = KernelContext::new("6.8.0", machine, "Linux version 6.8.0");
        assert_eq!(kernel.kbuild_arch(), arch);
    }

    #[test]
    fn system_root_reads_trimmed_pseudo_files() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = SystemRoot::new(Utf8PathBuf::try_from(temp.path().to_path_buf()).expect("UTF-8"));
        std::fs::create_dir_all(root.join("proc")).expect("mkdir");
        std::fs::write(root.join(PROC_VERSION), "Linux version 6.8.0 (gcc 13)\n").expect("write");
        assert_eq!(
            root.read_trimmed(PROC_VERSION).expect("read"),
            "Linux version 6.8.0 (gcc 13)"
        );
    }

    #[test]
    fn new_context_targets_running_kernel() {
        let kernel = KernelContext::new("6.8.0", "x86_64", "sig");
        assert!(kernel.is_running());
        assert!(!kernel.not_running().is_running());
    }
}
