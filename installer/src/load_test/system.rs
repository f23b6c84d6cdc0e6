//! Kernel and system state touched around a load test.
//!
//! The collaborators here are traits so the load-test state machine can be
//! driven against mocks: [`KernelState`] reads and writes kernel pseudo
//! files, [`EventQueue`] pauses the device event daemon, and
//! [`DependencyLoader`] loads the modules the package depends on.

use crate::command::{CommandExecutor, Invocation, run_captured};
use crate::error::{InstallerError, Result};
use crate::kernel::SystemRoot;

/// Console log level pseudo file, relative to the system root.
pub const PRINTK: &str = "proc/sys/kernel/printk";

/// Directory holding per-package module warnings, relative to the root.
pub const WARNINGS_DIR: &str = "proc/driver";

/// Loaded module directory, relative to the root.
const SYS_MODULE: &str = "sys/module";

/// Warnings file reserved for documentation.
const WARNINGS_README: &str = "README";

/// EFI variable recording whether secure boot is enabled.
pub const SECURE_BOOT_VARIABLE: &str =
    "sys/firmware/efi/efivars/SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c";

/// A warning a loaded module registered for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleWarning {
    /// Name of the warnings file.
    pub name: String,
    /// Warning text.
    pub text: String,
}

/// Kernel state read and changed during a load test.
#[cfg_attr(test, mockall::automock)]
pub trait KernelState {
    /// Return true when `module` is loaded.
    fn is_loaded(&self, module: &str) -> bool;

    /// Return the current console log level.
    fn console_log_level(&self) -> Option<String>;

    /// Set the console log level.
    ///
    /// # Errors
    ///
    /// Returns an error when the pseudo file cannot be written.
    fn set_console_log_level(&self, level: &str) -> std::io::Result<()>;

    /// Return the warnings registered under `package`, skipping the README.
    fn module_warnings(&self, package: &str) -> Vec<ModuleWarning>;

    /// Return the last `lines` lines of the kernel ring buffer.
    fn kernel_log_tail(&self, lines: usize) -> String;
}

/// Pauses and resumes the device event queue.
#[cfg_attr(test, mockall::automock)]
pub trait EventQueue {
    /// Stop executing queued device events.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon cannot be told to pause.
    fn pause(&self) -> Result<()>;

    /// Resume executing queued device events.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon cannot be told to resume.
    fn resume(&self) -> Result<()>;
}

/// Loads and unloads modules the package depends on.
#[cfg_attr(test, mockall::automock)]
pub trait DependencyLoader {
    /// Load `module` and whatever it depends on.
    ///
    /// # Errors
    ///
    /// Returns an error when the module cannot be loaded.
    fn load(&self, module: &str) -> Result<()>;

    /// Unload `module`.
    ///
    /// # Errors
    ///
    /// Returns an error when the module cannot be unloaded.
    fn unload(&self, module: &str) -> Result<()>;
}

/// Kernel state of the host.
pub struct SystemKernelState<'a> {
    root: SystemRoot,
    executor: &'a dyn CommandExecutor,
}

impl<'a> SystemKernelState<'a> {
    /// Create a view of the kernel under `root`, reading the ring buffer
    /// through `executor`.
    #[must_use]
    pub fn new(root: SystemRoot, executor: &'a dyn CommandExecutor) -> Self {
        Self { root, executor }
    }
}

impl KernelState for SystemKernelState<'_> {
    fn is_loaded(&self, module: &str) -> bool {
        self.root
            .join(SYS_MODULE)
            .join(module.replace('-', "_"))
            .is_dir()
    }

    fn console_log_level(&self) -> Option<String> {
        let printk = self.root.read_trimmed(PRINTK).ok()?;
        printk.split_whitespace().next().map(str::to_owned)
    }

    fn set_console_log_level(&self, level: &str) -> std::io::Result<()> {
        std::fs::write(self.root.join(PRINTK), level)
    }

    fn module_warnings(&self, package: &str) -> Vec<ModuleWarning> {
        let dir = self.root.join(WARNINGS_DIR).join(package).join("warnings");
        let Ok(entries) = dir.read_dir_utf8() else {
            return Vec::new();
        };
        let mut warnings: Vec<ModuleWarning> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name() != WARNINGS_README)
            .filter_map(|entry| match std::fs::read_to_string(entry.path()) {
                Ok(text) => Some(ModuleWarning {
                    name: entry.file_name().to_owned(),
                    text: text.trim().to_owned(),
                }),
                Err(err) => {
                    log::warn!("unable to read module warning {}: {err}", entry.path());
                    None
                }
            })
            .collect();
        warnings.sort_by(|a, b| a.name.cmp(&b.name));
        warnings
    }

    fn kernel_log_tail(&self, lines: usize) -> String {
        match run_captured(self.executor, &Invocation::new("dmesg")) {
            Ok(outcome) if outcome.success() => tail(&outcome.output, lines),
            Ok(outcome) => {
                log::warn!("unable to read the kernel log: {}", outcome.message());
                String::new()
            }
            Err(err) => {
                log::warn!("unable to read the kernel log: {err}");
                String::new()
            }
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    all.into_iter().skip(skip).collect::<Vec<_>>().join("\n")
}

/// Return true when the firmware reports secure boot as enabled.
///
/// The EFI variable holds four attribute bytes followed by the value.
#[must_use]
pub fn secure_boot_enabled(root: &SystemRoot) -> bool {
    std::fs::read(root.join(SECURE_BOOT_VARIABLE))
        .map(|bytes| bytes.get(4) == Some(&1))
        .unwrap_or(false)
}

/// Controls the udev event queue.
pub struct UdevEventQueue<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> UdevEventQueue<'a> {
    /// Create a queue controller running `udevadm` through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    fn control(&self, flag: &str) -> Result<()> {
        let invocation = Invocation::new("udevadm").args(["control", flag]);
        let outcome = run_captured(self.executor, &invocation)?;
        if outcome.success() {
            return Ok(());
        }
        Err(InstallerError::ToolFailed {
            command: invocation.command_line(),
            status: outcome.status,
            output: outcome.message(),
        })
    }
}

impl EventQueue for UdevEventQueue<'_> {
    fn pause(&self) -> Result<()> {
        self.control("--stop-exec-queue")
    }

    fn resume(&self) -> Result<()> {
        self.control("--start-exec-queue")
    }
}

/// Loads dependencies with `modprobe`.
pub struct ModprobeDependencies<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> ModprobeDependencies<'a> {
    /// Create a loader running `modprobe` through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    fn modprobe(&self, invocation: Invocation) -> Result<()> {
        let outcome = run_captured(self.executor, &invocation)?;
        if outcome.success() {
            return Ok(());
        }
        Err(InstallerError::ToolFailed {
            command: invocation.command_line(),
            status: outcome.status,
            output: outcome.message(),
        })
    }
}

impl DependencyLoader for ModprobeDependencies<'_> {
    fn load(&self, module: &str) -> Result<()> {
        self.modprobe(Invocation::new("modprobe").arg(module))
    }

    fn unload(&self, module: &str) -> Result<()> {
        self.modprobe(Invocation::new("modprobe").args(["-r", module]))
    }
}

/// Sets the console log level and restores the previous level when dropped.
pub struct LogLevelGuard<'s> {
    state: &'s dyn KernelState,
    previous: Option<String>,
}

impl<'s> LogLevelGuard<'s> {
    /// Save the current level and switch to `level`.
    ///
    /// Failing to change the level only loses console noise suppression, so
    /// it is logged and the test goes ahead.
    pub fn set(state: &'s dyn KernelState, level: &str) -> Self {
        let previous = state.console_log_level();
        if previous.is_some() {
            if let Err(err) = state.set_console_log_level(level) {
                log::warn!("unable to set the console log level to {level}: {err}");
            }
        }
        Self { state, previous }
    }
}

impl Drop for LogLevelGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous {
            if let Err(err) = self.state.set_console_log_level(previous) {
                log::warn!("unable to restore the console log level {previous}: {err}");
            }
        }
    }
}
