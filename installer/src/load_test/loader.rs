//! Kernel module insertion and removal.
//!
//! [`SyscallLoader`] reads the module image and calls `init_module(2)`
//! directly, passing the module parameters as one string; removal uses a
//! non-blocking `delete_module(2)`. When the syscall path is unusable
//! (not root, or no `/proc/modules`), [`ProcessLoader`] drives `insmod` and
//! `rmmod` instead and recovers the error code from their diagnostics.

use crate::command::{CommandExecutor, Invocation, run_captured};
use crate::kernel::SystemRoot;
use camino::Utf8Path;
use nix::errno::Errno;
use nix::kmod::{DeleteModuleFlags, delete_module, init_module};
use std::ffi::CString;
use thiserror::Error;

/// Table of loaded modules, relative to the system root.
const PROC_MODULES: &str = "proc/modules";

/// A failed insertion or removal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({})", .errno.desc())]
pub struct LoadError {
    /// Error code reported by the kernel.
    pub errno: Errno,
    /// Description of the failed operation.
    pub message: String,
}

impl LoadError {
    /// Create an error for `errno`.
    #[must_use]
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

/// Inserts and removes kernel modules.
#[cfg_attr(test, mockall::automock)]
pub trait ModuleLoader {
    /// Insert the module at `path` with `parameters`.
    ///
    /// # Errors
    ///
    /// Returns the kernel's error code when insertion fails.
    fn insert(&self, path: &Utf8Path, parameters: &str) -> Result<(), LoadError>;

    /// Remove the loaded module `name`.
    ///
    /// # Errors
    ///
    /// Returns the kernel's error code when removal fails.
    fn remove(&self, name: &str) -> Result<(), LoadError>;
}

/// Loads modules through the module syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallLoader;

impl ModuleLoader for SyscallLoader {
    fn insert(&self, path: &Utf8Path, parameters: &str) -> Result<(), LoadError> {
        let image = std::fs::read(path).map_err(|err| {
            LoadError::new(
                err.raw_os_error().map_or(Errno::EIO, Errno::from_raw),
                format!("unable to read {path}: {err}"),
            )
        })?;
        let params = CString::new(parameters)
            .map_err(|_| LoadError::new(Errno::EINVAL, "module parameters contain a NUL byte"))?;
        init_module(&image, &params)
            .map_err(|errno| LoadError::new(errno, format!("unable to insert {path}")))
    }

    fn remove(&self, name: &str) -> Result<(), LoadError> {
        let c_name = CString::new(name)
            .map_err(|_| LoadError::new(Errno::EINVAL, "module name contains a NUL byte"))?;
        delete_module(&c_name, DeleteModuleFlags::O_NONBLOCK)
            .map_err(|errno| LoadError::new(errno, format!("unable to remove {name}")))
    }
}

/// Loads modules by running `insmod` and `rmmod`.
pub struct ProcessLoader<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> ProcessLoader<'a> {
    /// Create a loader running commands through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    fn run(&self, invocation: &Invocation, what: String) -> Result<(), LoadError> {
        let outcome = run_captured(self.executor, invocation)
            .map_err(|err| LoadError::new(Errno::ENOEXEC, format!("{what}: {err}")))?;
        if outcome.success() {
            return Ok(());
        }
        Err(LoadError::new(
            errno_from_diagnostic(&outcome.output),
            format!("{what}: {}", outcome.message()),
        ))
    }
}

impl ModuleLoader for ProcessLoader<'_> {
    fn insert(&self, path: &Utf8Path, parameters: &str) -> Result<(), LoadError> {
        let invocation = Invocation::new("insmod")
            .arg(path.as_str())
            .args(parameters.split_whitespace());
        self.run(&invocation, format!("unable to insert {path}"))
    }

    fn remove(&self, name: &str) -> Result<(), LoadError> {
        self.run(
            &Invocation::new("rmmod").arg(name),
            format!("unable to remove {name}"),
        )
    }
}

/// Codes whose descriptions appear in `insmod`/`rmmod` diagnostics.
const DIAGNOSTIC_ERRNOS: [Errno; 9] = [
    Errno::EEXIST,
    Errno::ENOKEY,
    Errno::EKEYREJECTED,
    Errno::EPERM,
    Errno::ENOENT,
    Errno::EBUSY,
    Errno::ENOMEM,
    Errno::EINVAL,
    Errno::ENODEV,
];

/// Recover the error code from a loader diagnostic.
///
/// kmod reports `ENOEXEC` as "Invalid module format" and an unresolved
/// symbol as "Unknown symbol in module"; every other code uses the C
/// library's description.
#[must_use]
pub fn errno_from_diagnostic(output: &str) -> Errno {
    if output.contains("Invalid module format") {
        return Errno::ENOEXEC;
    }
    if output.contains("Unknown symbol in module") {
        return Errno::ENOENT;
    }
    DIAGNOSTIC_ERRNOS
        .into_iter()
        .find(|errno| output.contains(errno.desc()))
        .unwrap_or(Errno::UnknownErrno)
}

/// Choose the syscall loader when this process can use it.
#[must_use]
pub fn select_loader<'a>(
    root: &SystemRoot,
    executor: &'a dyn CommandExecutor,
) -> Box<dyn ModuleLoader + 'a> {
    let is_root = nix::unistd::geteuid().is_root();
    if is_root && root.join(PROC_MODULES).exists() {
        log::debug!("loading modules through init_module(2)");
        Box::new(SyscallLoader)
    } else {
        log::debug!("loading modules through insmod (root: {is_root})");
        Box::new(ProcessLoader::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallerError;
    use crate::test_utils::{ExpectedCall, StubExecutor};
    use rstest::rstest;

    #[rstest]
    #[case::already_loaded("insmod: ERROR: could not insert module core.ko: File exists", Errno::EEXIST)]
    #[case::no_key("insmod: ERROR: could not insert module core.ko: Required key not available", Errno::ENOKEY)]
    #[case::format("insmod: ERROR: could not insert module core.ko: Invalid module format", Errno::ENOEXEC)]
    #[case::symbol("insmod: ERROR: could not insert module core.ko: Unknown symbol in module", Errno::ENOENT)]
    #[case::unrecognised("something odd happened", Errno::UnknownErrno)]
    fn diagnostics_map_to_error_codes(#[case] output: &str, #[case] expected: Errno) {
        assert_eq!(errno_from_diagnostic(output), expected);
    }

    #[test]
    fn process_loader_passes_parameters_as_separate_arguments() {
        let executor = StubExecutor::new(vec![ExpectedCall::new(
            "insmod",
            ["/pkg/kernel/core.ko modeset=1 fbdev=1"],
        )]);

        ProcessLoader::new(&executor)
            .insert(Utf8Path::new("/pkg/kernel/core.ko"), "modeset=1 fbdev=1")
            .expect("insert succeeds");

        executor.assert_finished();
    }

    #[test]
    fn process_loader_reports_recovered_error_code() {
        let executor = StubExecutor::new(vec![ExpectedCall::new("insmod", ["core.ko"]).fails(
            1,
            "insmod: ERROR: could not insert module core.ko: Key was rejected by service",
        )]);

        let err = ProcessLoader::new(&executor)
            .insert(Utf8Path::new("core.ko"), "")
            .expect_err("insert fails");

        assert_eq!(err.errno, Errno::EKEYREJECTED);
        assert!(err.message.contains("Key was rejected"));
    }

    #[test]
    fn missing_insmod_is_a_load_error() {
        let executor = StubExecutor::new(vec![ExpectedCall::new("rmmod", ["core"]).errors(
            InstallerError::ToolNotFound {
                tool: "rmmod".to_owned(),
                reason: "No such file or directory".to_owned(),
            },
        )]);

        let err = ProcessLoader::new(&executor)
            .remove("core")
            .expect_err("rmmod missing");

        assert!(err.message.contains("unable to remove core"));
    }

    #[test]
    fn syscall_loader_reports_unreadable_image() {
        let err = SyscallLoader
            .insert(Utf8Path::new("/nonexistent/kmodsmith/core.ko"), "")
            .expect_err("no such file");
        assert_eq!(err.errno, Errno::ENOENT);
    }
}
