//! Kernel module type selection.
//!
//! A package can ship its kernel modules in more than one build variant,
//! each in its own directory under the package root. The selector filters
//! the static variant table down to the variants that are present and
//! usable with the detected GPUs, and picks a default by a fixed preference.
//! GPUs are detected from the display controllers listed in sysfs and
//! checked against the `[gpu]` limits of the package manifest.

use crate::config::{GpuSupport, ModuleTypeOverride};
use crate::error::{InstallerError, Result};
use crate::kernel::SystemRoot;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

/// A kernel module build variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
    /// Modules built from the closed-source core.
    Proprietary,
    /// Modules built from the open-source kernel module tree.
    Open,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Proprietary => "proprietary",
            Self::Open => "open",
        })
    }
}

/// Static description of one variant.
#[derive(Debug, PartialEq, Eq)]
pub struct Variant {
    /// The variant.
    pub module_type: ModuleType,
    /// Build directory name inside the package.
    pub directory: &'static str,
    /// `MODULE_LICENSE` string of the built modules.
    pub license: &'static str,
    /// Single-letter code accepted on the command line.
    pub letter: char,
}

/// Every variant a package may ship, in display order.
pub static VARIANTS: [Variant; 2] = [
    Variant {
        module_type: ModuleType::Open,
        directory: "kernel-open",
        license: "Dual MIT/GPL",
        letter: 'O',
    },
    Variant {
        module_type: ModuleType::Proprietary,
        directory: "kernel",
        license: "Proprietary",
        letter: 'P',
    },
];

/// Preference order used to pick the default variant.
const PREFERENCE: [ModuleType; 2] = [ModuleType::Proprietary, ModuleType::Open];

/// PCI device directory relative to the system root.
const PCI_DEVICES: &str = "sys/bus/pci/devices";

/// PCI base class of display controllers.
const DISPLAY_CLASS: &str = "03";

/// Variants that cannot drive at least one detected GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuCompatibility {
    /// A detected GPU is not supported by the proprietary modules.
    pub proprietary_unsupported: bool,
    /// A detected GPU is not supported by the open modules.
    pub open_unsupported: bool,
}

impl GpuCompatibility {
    /// Return true when `module_type` supports every detected GPU.
    #[must_use]
    pub fn supports(&self, module_type: ModuleType) -> bool {
        match module_type {
            ModuleType::Proprietary => !self.proprietary_unsupported,
            ModuleType::Open => !self.open_unsupported,
        }
    }

    /// Check the display controllers under `root` against `support`.
    ///
    /// When the device list cannot be read every variant stays usable.
    #[must_use]
    pub fn detect(root: &SystemRoot, support: &GpuSupport) -> Self {
        let mut compatibility = Self::default();
        let dir = root.join(PCI_DEVICES);
        let Ok(entries) = dir.read_dir_utf8() else {
            log::debug!("unable to list PCI devices in {dir}");
            return compatibility;
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let Some(device) = display_controller(root, entry.file_name(), support) else {
                continue;
            };
            if support.proprietary_unsupported.iter().any(|id| same_id(id, &device)) {
                log::info!(
                    "GPU {} ({device}) is not supported by the proprietary kernel modules",
                    entry.file_name()
                );
                compatibility.proprietary_unsupported = true;
            }
            if support.open_unsupported.iter().any(|id| same_id(id, &device)) {
                log::info!(
                    "GPU {} ({device}) is not supported by the open kernel modules",
                    entry.file_name()
                );
                compatibility.open_unsupported = true;
            }
        }
        compatibility
    }
}

/// Return the device id of PCI device `address` when it is a display
/// controller from the package's vendor.
fn display_controller(root: &SystemRoot, address: &str, support: &GpuSupport) -> Option<String> {
    let dir = Utf8Path::new(PCI_DEVICES).join(address);
    let class = root.read_trimmed(dir.join("class")).ok()?;
    if !normalise_id(&class).starts_with(DISPLAY_CLASS) {
        return None;
    }
    let vendor = root.read_trimmed(dir.join("vendor")).ok()?;
    if support.vendor.as_deref().is_some_and(|wanted| !same_id(wanted, &vendor)) {
        return None;
    }
    root.read_trimmed(dir.join("device")).ok()
}

fn same_id(a: &str, b: &str) -> bool {
    normalise_id(a) == normalise_id(b)
}

fn normalise_id(id: &str) -> String {
    let id = id.trim();
    id.strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id)
        .to_ascii_lowercase()
}

/// The valid variants and the default among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSelection {
    /// Valid variants in display order.
    pub valid: Vec<&'static Variant>,
    /// Index of the default variant in `valid`.
    pub default_index: usize,
    default: &'static Variant,
}

impl VariantSelection {
    /// Return the default variant.
    #[must_use]
    pub fn default_variant(&self) -> &'static Variant {
        self.default
    }
}

/// Selects the kernel module type for a package.
#[derive(Debug)]
pub struct ModuleTypeSelector<'a> {
    package_dir: &'a Utf8Path,
    compatibility: GpuCompatibility,
}

impl<'a> ModuleTypeSelector<'a> {
    /// Create a selector for the package at `package_dir`.
    #[must_use]
    pub fn new(package_dir: &'a Utf8Path, compatibility: GpuCompatibility) -> Self {
        Self {
            package_dir,
            compatibility,
        }
    }

    /// Return the build directory for `variant`.
    #[must_use]
    pub fn build_dir(&self, variant: &Variant) -> Utf8PathBuf {
        self.package_dir.join(variant.directory)
    }

    /// List the variants that are present and usable.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::NoSupportedModuleType`] when no variant
    /// remains.
    pub fn valid_variants(&self) -> Result<VariantSelection> {
        let valid: Vec<&'static Variant> = VARIANTS
            .iter()
            .filter(|v| self.is_present(v) && self.compatibility.supports(v.module_type))
            .collect();

        let default = PREFERENCE.iter().find_map(|preferred| {
            valid
                .iter()
                .copied()
                .find(|v| v.module_type == *preferred)
        });
        let Some(default) = default else {
            let present: Vec<&str> = VARIANTS
                .iter()
                .filter(|v| self.is_present(v))
                .map(|v| v.directory)
                .collect();
            let reason = if present.is_empty() {
                format!("the package at {} ships no kernel module sources", self.package_dir)
            } else {
                format!(
                    "the detected GPUs are not supported by the shipped kernel module types ({})",
                    present.join(", ")
                )
            };
            return Err(InstallerError::NoSupportedModuleType { reason });
        };
        let default_index = valid
            .iter()
            .position(|v| std::ptr::eq(*v, default))
            .unwrap_or_default();

        Ok(VariantSelection {
            valid,
            default_index,
            default,
        })
    }

    /// Choose the variant, honouring an operator override.
    ///
    /// # Errors
    ///
    /// Propagates errors from the override or from [`Self::valid_variants`].
    pub fn select(&self, requested: Option<&ModuleTypeOverride>) -> Result<&'static Variant> {
        match requested {
            Some(ModuleTypeOverride::Directory(dir)) => self.override_by_directory(dir),
            Some(ModuleTypeOverride::Letter(letter)) => self.override_by_letter(*letter),
            None => Ok(self.valid_variants()?.default_variant()),
        }
    }

    /// Force the variant built from `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory names no variant or is missing
    /// from the package.
    pub fn override_by_directory(&self, directory: &str) -> Result<&'static Variant> {
        let variant = VARIANTS
            .iter()
            .find(|v| v.directory == directory)
            .ok_or_else(|| InstallerError::UnknownModuleType {
                value: directory.to_owned(),
            })?;
        self.forced(variant)
    }

    /// Force the variant with type letter `letter` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error when the letter names no variant or the variant is
    /// missing from the package.
    pub fn override_by_letter(&self, letter: char) -> Result<&'static Variant> {
        let variant = VARIANTS
            .iter()
            .find(|v| v.letter.eq_ignore_ascii_case(&letter))
            .ok_or_else(|| InstallerError::UnknownModuleType {
                value: letter.to_string(),
            })?;
        self.forced(variant)
    }

    fn forced(&self, variant: &'static Variant) -> Result<&'static Variant> {
        if !self.is_present(variant) {
            return Err(InstallerError::ModuleTypeMissing {
                directory: variant.directory.to_owned(),
            });
        }
        if !self.compatibility.supports(variant.module_type) {
            log::warn!(
                "the {} kernel modules were requested, but they do not support every GPU in this system",
                variant.module_type
            );
        }
        Ok(variant)
    }

    fn is_present(&self, variant: &Variant) -> bool {
        self.build_dir(variant).is_dir()
    }
}
