//! Error types for the kernel module installer.
//!
//! This module defines semantic error variants that explain the most likely
//! root cause of a failure. Each variant that has an obvious remediation also
//! carries a recovery hint, exposed through [`InstallerError::recovery_hint`].

use crate::artefact::error::ArtefactError;
use crate::artefact::extraction::ExtractionError;
use crate::artefact::packaging_error::PackagingError;
use crate::module_spec::ModuleName;
use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that can occur while building, signing, or testing kernel modules.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// No kernel source tree could be located through any configured source.
    #[error("unable to find the kernel source tree for the currently running kernel {kernel}")]
    KernelSourceNotFound {
        /// Kernel release the search was performed for.
        kernel: String,
    },

    /// An explicitly requested kernel path does not exist.
    #[error("kernel {what} path '{path}' does not exist")]
    KernelPathMissing {
        /// Which path was being validated (`source` or `output`).
        what: &'static str,
        /// The rejected path.
        path: Utf8PathBuf,
    },

    /// The kernel source path does not contain the expected header.
    #[error("kernel source path '{path}' does not contain '{header}'")]
    KernelHeaderMissing {
        /// The rejected source path.
        path: Utf8PathBuf,
        /// Relative path of the header that was expected.
        header: &'static str,
    },

    /// The operator did not supply a usable path within the retry limit.
    #[error("no valid kernel source path was supplied after {attempts} attempts")]
    PromptAttemptsExhausted {
        /// Number of prompts issued.
        attempts: u32,
    },

    /// A required external program could not be found or executed.
    #[error("unable to run '{tool}': {reason}")]
    ToolNotFound {
        /// Name or path of the missing program.
        tool: String,
        /// Description of the lookup failure.
        reason: String,
    },

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed with status {status}: {output}")]
    ToolFailed {
        /// The command line that failed.
        command: String,
        /// The exit status reported by the command.
        status: i32,
        /// The trimmed combined output of the command.
        output: String,
    },

    /// A kernel feature test rejected the target kernel or toolchain.
    #[error("kernel sanity check '{test}' failed: {message}")]
    SanityCheckFailed {
        /// Name of the failing feature test.
        test: String,
        /// Diagnostic text produced by the feature test itself.
        message: String,
    },

    /// The target kernel configuration conflicts with this package.
    #[error("kernel configuration conflict: {reason}")]
    ConfigurationConflict {
        /// Description of the conflicting setting.
        reason: String,
    },

    /// A non-optional kernel module was not produced by the build.
    #[error("kernel module {module} was not produced by the build: {reason}")]
    ModuleBuildFailed {
        /// The module that failed to build.
        module: ModuleName,
        /// Description of the failure.
        reason: String,
    },

    /// The aggregate kernel module build exited unsuccessfully.
    #[error("the kernel module build exited with status {status}")]
    BuildFailed {
        /// Aggregate exit status of the full build.
        status: i32,
    },

    /// A signing key was not given or does not exist.
    #[error("module signing {which} key {}", key_location(.path.as_deref()))]
    SigningKeyMissing {
        /// Which key was missing (`secret` or `public`).
        which: &'static str,
        /// Where the key was expected, when a path was given.
        path: Option<Utf8PathBuf>,
    },

    /// The kernel's signing helper could not be found.
    #[error("unable to find the kernel module signing helper; searched {searched}")]
    SignFileNotFound {
        /// Locations that were searched.
        searched: String,
    },

    /// The hash algorithm for module signing could not be determined.
    #[error("unable to determine the module signing hash algorithm: {reason}")]
    SigningHashUnresolved {
        /// Output of the failed check.
        reason: String,
    },

    /// Signing a kernel module failed.
    #[error("failed to sign {module}: {reason}")]
    SigningFailed {
        /// File name of the module being signed.
        module: String,
        /// Description of the failure.
        reason: String,
    },

    /// No kernel module type in the package is usable on this system.
    #[error("no supported kernel module type is available: {reason}")]
    NoSupportedModuleType {
        /// Explanation of why every variant was excluded.
        reason: String,
    },

    /// A forced kernel module type directory is not part of the package.
    #[error("kernel module type directory '{directory}' is not part of this package")]
    ModuleTypeMissing {
        /// The requested build directory name.
        directory: String,
    },

    /// A forced kernel module type is not recognised.
    #[error("unknown kernel module type '{value}'")]
    UnknownModuleType {
        /// The rejected directory name or type letter.
        value: String,
    },

    /// A kernel module failed to load into the running kernel.
    #[error("kernel module {module} failed to load: {reason}")]
    LoadFailed {
        /// The module that failed to load.
        module: ModuleName,
        /// Description of the failure including captured kernel log lines.
        reason: String,
    },

    /// The kernel requires signed modules but the module was not signed.
    #[error("kernel module {module} failed to load because it is not signed and the kernel requires trusted module signatures")]
    SignatureRequired {
        /// The unsigned module.
        module: ModuleName,
    },

    /// The operator declined to continue.
    #[error("installation aborted: {reason}")]
    Aborted {
        /// Why the operator was asked.
        reason: String,
    },

    /// The package manifest could not be read or is invalid.
    #[error("invalid package manifest at {path}: {reason}")]
    InvalidPackageManifest {
        /// Path of the manifest.
        path: Utf8PathBuf,
        /// Description of the parse or validation failure.
        reason: String,
    },

    /// Another installer process holds the install lock.
    #[error("another installer is already running (lock held at {path})")]
    LockHeld {
        /// Path of the lock file.
        path: Utf8PathBuf,
    },

    /// A precompiled bundle is malformed.
    #[error("precompiled bundle error: {0}")]
    Bundle(#[from] ArtefactError),

    /// Packaging a precompiled bundle failed.
    #[error("precompiled packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    /// Unpacking a precompiled bundle failed.
    #[error("precompiled unpacking failed: {0}")]
    Extraction(#[from] ExtractionError),

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallerError {
    /// Return the remediation an operator should try, if one is known.
    #[must_use]
    pub fn recovery_hint(&self) -> Option<&'static str> {
        match self {
            Self::KernelSourceNotFound { .. } | Self::KernelHeaderMissing { .. } => Some(
                "install the kernel headers for this kernel, or pass --kernel-source-path / set SYSSRC",
            ),
            Self::KernelPathMissing { .. } => {
                Some("check the --kernel-source-path and --kernel-output-path values (or SYSSRC / SYSOUT)")
            }
            Self::ToolNotFound { .. } => Some(
                "install the development tools for your distribution (make, a C compiler, binutils)",
            ),
            Self::SanityCheckFailed { test, .. } if test == "cc_version_check" => Some(
                "rebuild with the compiler the kernel was built with, or pass --ignore-cc-mismatch",
            ),
            Self::SignFileNotFound { .. } => {
                Some("pass --module-signing-script with the path of the kernel's sign-file helper")
            }
            Self::SigningKeyMissing { .. } => {
                Some("pass both --module-signing-secret-key and --module-signing-public-key")
            }
            Self::SigningHashUnresolved { .. } => {
                Some("pass --module-signing-hash to select the hash algorithm explicitly")
            }
            Self::SigningFailed { .. } => Some(
                "check that the signing keys match and that the kernel's sign-file helper works",
            ),
            Self::SignatureRequired { .. } => Some(
                "sign the module with a key enrolled in the kernel keyring using --module-signing-secret-key and --module-signing-public-key, or disable secure boot",
            ),
            Self::LoadFailed { .. } => {
                Some("review the kernel log lines above for the reason the kernel rejected the module")
            }
            Self::LockHeld { .. } => Some("wait for the other installer to finish and retry"),
            Self::ModuleTypeMissing { .. } | Self::UnknownModuleType { .. } => {
                Some("select one of the kernel module types shipped with this package")
            }
            _ => None,
        }
    }
}

fn key_location(path: Option<&camino::Utf8Path>) -> String {
    match path {
        Some(path) => format!("not found at {path}"),
        None => "was not specified".to_owned(),
    }
}

/// Result type alias using [`InstallerError`].
pub type Result<T> = std::result::Result<T, InstallerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn header_missing_names_the_header() {
        let err = InstallerError::KernelHeaderMissing {
            path: Utf8PathBuf::from("/usr/src/linux"),
            header: "include/linux/kernel.h",
        };
        let msg = err.to_string();
        assert!(msg.contains("/usr/src/linux"));
        assert!(msg.contains("include/linux/kernel.h"));
    }

    #[test]
    fn tool_failure_includes_command_and_output() {
        let err = InstallerError::ToolFailed {
            command: "make -C /tmp/build modules".to_owned(),
            status: 2,
            output: "error: implicit declaration".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("make -C /tmp/build modules"));
        assert!(msg.contains("status 2"));
        assert!(msg.contains("implicit declaration"));
    }

    #[rstest]
    #[case::cc_mismatch("cc_version_check", true)]
    #[case::other_check("xen_sanity_check", false)]
    fn cc_mismatch_hint_only_for_compiler_check(#[case] test: &str, #[case] has_hint: bool) {
        let err = InstallerError::SanityCheckFailed {
            test: test.to_owned(),
            message: "failed".to_owned(),
        };
        assert_eq!(err.recovery_hint().is_some(), has_hint);
    }

    #[test]
    fn unsigned_module_hint_names_signing_options() {
        let err = InstallerError::SignatureRequired {
            module: ModuleName::from("core"),
        };
        let hint = err.recovery_hint().expect("hint for unsigned module");
        assert!(hint.contains("--module-signing-secret-key"));
        assert!(err.to_string().contains("not signed"));
    }

    #[test]
    fn io_error_preserves_source() {
        let err = InstallerError::from(std::io::Error::other("disk full"));
        assert!(err.to_string().contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
