//! Package manifest and installer options.
//!
//! The package manifest (`kmodsmith.toml` in the package directory) lists
//! the kernel modules the package ships, in dependency order, together with
//! the tool names used to build them. [`InstallOptions`] carries the
//! already-parsed command-line values consumed by the installer core.

use crate::error::{InstallerError, Result};
use crate::module_spec::{KernelModuleSpec, ModuleSet};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// File name of the package manifest inside the package directory.
pub const PACKAGE_MANIFEST: &str = "kmodsmith.toml";

/// Default `make` program.
const DEFAULT_MAKE: &str = "make";

/// Default linker used to join interface and core objects.
const DEFAULT_LINKER: &str = "ld";

/// Default compiler when neither the manifest nor `CC` names one.
const DEFAULT_COMPILER: &str = "cc";

/// External tool names used by the build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolNames {
    /// The `make` program.
    pub make: String,
    /// The linker used for interface linking.
    pub linker: String,
    /// The compiler used when `CC` is not set.
    pub compiler: String,
}

impl Default for ToolNames {
    fn default() -> Self {
        Self {
            make: DEFAULT_MAKE.to_owned(),
            linker: DEFAULT_LINKER.to_owned(),
            compiler: DEFAULT_COMPILER.to_owned(),
        }
    }
}

/// PCI devices the package's module types cannot drive.
///
/// Device ids are hexadecimal, with or without a `0x` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpuSupport {
    /// PCI vendor id the device lists apply to; any vendor when unset.
    pub vendor: Option<String>,
    /// Devices the proprietary modules do not support.
    pub proprietary_unsupported: Vec<String>,
    /// Devices the open modules do not support.
    pub open_unsupported: Vec<String>,
}

/// The package manifest describing the kernel modules to install.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageManifest {
    /// Package name, also used for the module warnings directory.
    pub name: String,
    /// Driver version every precompiled bundle must declare.
    pub version: String,
    /// Modules in dependency order.
    #[serde(rename = "module")]
    pub modules: Vec<KernelModuleSpec>,
    /// Kernel modules that must be loaded before the package's modules.
    #[serde(default)]
    pub preload: Vec<String>,
    /// Parameters passed to every module during the load test.
    #[serde(default)]
    pub module_parameters: String,
    /// External tool names.
    #[serde(default)]
    pub tools: ToolNames,
    /// GPU support limits of the shipped module types.
    #[serde(default)]
    pub gpu: GpuSupport,
}

impl PackageManifest {
    /// Load the manifest from `package_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::InvalidPackageManifest`] when the file is
    /// missing, unparsable, or lists no modules.
    pub fn load(package_dir: &Utf8Path) -> Result<Self> {
        let path = package_dir.join(PACKAGE_MANIFEST);
        let contents =
            std::fs::read_to_string(&path).map_err(|e| InstallerError::InvalidPackageManifest {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Self::parse(&contents).map_err(|reason| InstallerError::InvalidPackageManifest {
            path,
            reason,
        })
    }

    /// Parse manifest contents.
    ///
    /// # Errors
    ///
    /// Returns the parse or validation failure as text.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let manifest: Self = toml::from_str(contents).map_err(|e| format!("TOML parse error: {e}"))?;
        if manifest.modules.is_empty() {
            return Err("the manifest lists no kernel modules".to_owned());
        }
        if manifest.version.trim().is_empty() {
            return Err("the manifest declares an empty driver version".to_owned());
        }
        Ok(manifest)
    }

    /// Build the module set, dropping modules the operator disabled by name
    /// or by disable flag.
    ///
    /// Disabling a module that is not optional is ignored with a warning.
    #[must_use]
    pub fn module_set(&self, disabled: &[String]) -> ModuleSet {
        let mut set = ModuleSet::new(self.modules.clone());
        for value in disabled {
            match self.modules.iter().find(|spec| spec.is_disabled_by(value)) {
                Some(spec) if spec.is_optional() => {
                    set.remove(spec.name());
                }
                Some(spec) => log::warn!("module {} is required and cannot be disabled", spec.name()),
                None => log::warn!("ignoring request to disable unknown module {value}"),
            }
        }
        set
    }
}

/// Module signing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningOptions {
    /// Private key used to sign modules.
    pub secret_key: Option<Utf8PathBuf>,
    /// Public key matching `secret_key`.
    pub public_key: Option<Utf8PathBuf>,
    /// Hash algorithm override, e.g. `sha256`.
    pub hash: Option<String>,
    /// Explicit path of the kernel's `sign-file` helper.
    pub sign_file: Option<Utf8PathBuf>,
}

impl SigningOptions {
    /// Return true when the operator asked for signed modules.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.secret_key.is_some() || self.public_key.is_some()
    }
}

/// Forced kernel module type selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleTypeOverride {
    /// Force the variant built from this package directory.
    Directory(String),
    /// Force the variant with this type letter.
    Letter(char),
}

/// Environment overrides, read once at start and passed explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// `SYSSRC`: kernel source path override.
    pub sys_src: Option<Utf8PathBuf>,
    /// `SYSOUT`: kernel output path override.
    pub sys_out: Option<Utf8PathBuf>,
    /// `CC`: compiler override.
    pub cc: Option<String>,
}

impl Environment {
    /// Read the overrides from the process environment.
    ///
    /// Empty values are treated as unset.
    #[must_use]
    pub fn from_process() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            sys_src: read("SYSSRC").map(Utf8PathBuf::from),
            sys_out: read("SYSOUT").map(Utf8PathBuf::from),
            cc: read("CC"),
        }
    }

    /// Return the compiler, falling back to the manifest's tool name.
    #[must_use]
    pub fn compiler<'a>(&'a self, tools: &'a ToolNames) -> &'a str {
        self.cc.as_deref().unwrap_or(&tools.compiler)
    }
}

/// Already-parsed command-line values consumed by the installer core.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Directory containing the package manifest and module sources.
    pub package_dir: Utf8PathBuf,
    /// Target kernel release; defaults to the running kernel.
    pub kernel_name: Option<String>,
    /// Explicit kernel source path.
    pub kernel_source_path: Option<Utf8PathBuf>,
    /// Explicit kernel output path.
    pub kernel_output_path: Option<Utf8PathBuf>,
    /// Deprecated kernel include path; its parent is used as source path.
    pub kernel_include_path: Option<Utf8PathBuf>,
    /// Module signing configuration.
    pub signing: SigningOptions,
    /// Parallel build jobs passed to `make`.
    pub concurrency: usize,
    /// Expert mode: allow prompts that are otherwise skipped.
    pub expert: bool,
    /// Forced kernel module type.
    pub module_type: Option<ModuleTypeOverride>,
    /// Optional modules the operator disabled, by name or disable flag.
    pub disabled_modules: Vec<String>,
    /// Skip the precompiled bundle search.
    pub skip_precompiled: bool,
    /// Operator-specified precompiled search path.
    pub precompiled_path: Option<Utf8PathBuf>,
    /// Produce a precompiled bundle in this directory instead of installing.
    pub package_precompiled: Option<Utf8PathBuf>,
    /// Accept a compiler that differs from the one the kernel was built with.
    pub ignore_cc_mismatch: bool,
    /// Skip the module load test.
    pub skip_load_test: bool,
    /// Never prompt; take the default answer to every question.
    pub no_questions: bool,
    /// Suppress progress output.
    pub quiet: bool,
    /// Lock file guarding against concurrent installer runs.
    pub lock_path: Option<Utf8PathBuf>,
}
