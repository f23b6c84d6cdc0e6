//! Kernel module descriptions and the active module set.
//!
//! A [`KernelModuleSpec`] describes one module shipped by the package. The
//! [`ModuleSet`] keeps the specs in dependency order: modules are loaded
//! front-to-back and unloaded back-to-front. Removing a module from the set
//! records it in the exclusion list passed to every subsequent build.

use serde::Deserialize;
use std::fmt;

/// A semantic kernel module name.
///
/// This newtype keeps module names distinct from file names and other
/// strings threaded through the build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct ModuleName(String);

impl ModuleName {
    /// Create a new module name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the module name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the name the kernel reports for the loaded module.
    ///
    /// The kernel normalises dashes to underscores in `/sys/module`.
    #[must_use]
    pub fn kernel_name(&self) -> String {
        self.0.replace('-', "_")
    }
}

impl AsRef<str> for ModuleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ModuleName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a module is assembled from the package contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleLayout {
    /// The module file is built and installed as a single unit.
    SelfContained,
    /// A per-kernel interface object is linked against a shipped core object.
    SplitInterface {
        /// File name of the interface object built for each kernel.
        interface: String,
        /// File name of the kernel-independent core object.
        core_object: String,
    },
}

/// Why a module description was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleSpecError {
    /// Only one of the interface and core object is named, or one is blank.
    #[error("module {module} must name both an interface and a core object, or neither")]
    IncompleteInterface {
        /// The module.
        module: ModuleName,
    },

    /// The module file name is blank.
    #[error("module {module} has an empty filename")]
    EmptyFilename {
        /// The module.
        module: ModuleName,
    },
}

/// Details that only apply to optional modules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OptionalModule {
    /// Human-readable description of the features depending on the module.
    pub dependee: String,
    /// Command-line flag that disables the module.
    pub disable_flag: String,
}

/// One kernel module belonging to the package.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ModuleEntry")]
pub struct KernelModuleSpec {
    name: ModuleName,
    filename: String,
    layout: ModuleLayout,
    optional: Option<OptionalModule>,
}

impl KernelModuleSpec {
    /// Describe a required, self-contained module.
    #[must_use]
    pub fn new(name: impl Into<ModuleName>, filename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: filename.into(),
            layout: ModuleLayout::SelfContained,
            optional: None,
        }
    }

    /// Build the module from a per-kernel interface and a shipped core object.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleSpecError::IncompleteInterface`] when either name is
    /// blank.
    pub fn with_interface(
        mut self,
        interface: impl Into<String>,
        core_object: impl Into<String>,
    ) -> Result<Self, ModuleSpecError> {
        self.layout = split_layout(&self.name, interface.into(), core_object.into())?;
        Ok(self)
    }

    /// Mark the module optional.
    #[must_use]
    pub fn optional(mut self, dependee: impl Into<String>, disable_flag: impl Into<String>) -> Self {
        self.optional = Some(OptionalModule {
            dependee: dependee.into(),
            disable_flag: disable_flag.into(),
        });
        self
    }

    /// Return the canonical module name.
    #[must_use]
    pub fn name(&self) -> &ModuleName {
        &self.name
    }

    /// Return the on-disk file name of the built module.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Return how the module is assembled.
    #[must_use]
    pub fn layout(&self) -> &ModuleLayout {
        &self.layout
    }

    /// Return true when the module is linked from a separate interface file.
    #[must_use]
    pub fn has_separate_interface(&self) -> bool {
        matches!(self.layout, ModuleLayout::SplitInterface { .. })
    }

    /// Return the optional-module details, if the module is optional.
    #[must_use]
    pub fn optional_details(&self) -> Option<&OptionalModule> {
        self.optional.as_ref()
    }

    /// Return true when a failure of this module must not abort installation.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional.is_some()
    }

    /// Return true when `value` disables this module, either by module name
    /// or by its disable flag.
    #[must_use]
    pub fn is_disabled_by(&self, value: &str) -> bool {
        self.name.as_str() == value
            || self
                .optional
                .as_ref()
                .is_some_and(|details| details.disable_flag == value)
    }

    /// Describe how the operator could have skipped this module.
    #[must_use]
    pub fn disable_hint(&self) -> Option<String> {
        self.optional.as_ref().map(|details| {
            format!(
                "{} is only needed for {}; pass --disable-module {} to skip it",
                self.name, details.dependee, details.disable_flag
            )
        })
    }
}

/// Raw module entry as written in the package manifest.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleEntry {
    name: ModuleName,
    filename: String,
    interface: Option<String>,
    core_object: Option<String>,
    optional: Option<OptionalModule>,
}

fn split_layout(
    module: &ModuleName,
    interface: String,
    core_object: String,
) -> Result<ModuleLayout, ModuleSpecError> {
    if interface.trim().is_empty() || core_object.trim().is_empty() {
        return Err(ModuleSpecError::IncompleteInterface {
            module: module.clone(),
        });
    }
    Ok(ModuleLayout::SplitInterface {
        interface,
        core_object,
    })
}

impl TryFrom<ModuleEntry> for KernelModuleSpec {
    type Error = ModuleSpecError;

    fn try_from(entry: ModuleEntry) -> Result<Self, Self::Error> {
        let layout = match (entry.interface, entry.core_object) {
            (Some(interface), Some(core_object)) => {
                split_layout(&entry.name, interface, core_object)?
            }
            (None, None) => ModuleLayout::SelfContained,
            _ => {
                return Err(ModuleSpecError::IncompleteInterface { module: entry.name });
            }
        };

        if entry.filename.trim().is_empty() {
            return Err(ModuleSpecError::EmptyFilename { module: entry.name });
        }

        Ok(Self {
            name: entry.name,
            filename: entry.filename,
            layout,
            optional: entry.optional,
        })
    }
}

/// The active set of modules, in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    modules: Vec<KernelModuleSpec>,
    excluded: Vec<ModuleName>,
}

impl ModuleSet {
    /// Create a set from specs already in dependency order.
    #[must_use]
    pub fn new(modules: Vec<KernelModuleSpec>) -> Self {
        Self {
            modules,
            excluded: Vec::new(),
        }
    }

    /// Remove a module from the active set and exclude it from later builds.
    ///
    /// Returns `false` when the module is not part of the set.
    pub fn remove(&mut self, name: &ModuleName) -> bool {
        let before = self.modules.len();
        self.modules.retain(|spec| spec.name() != name);
        let removed = self.modules.len() != before;
        if removed && !self.excluded.contains(name) {
            self.excluded.push(name.clone());
        }
        removed
    }

    /// Iterate over the modules in load order.
    pub fn iter(&self) -> impl Iterator<Item = &KernelModuleSpec> {
        self.modules.iter()
    }

    /// Iterate over the modules in unload order.
    pub fn unload_order(&self) -> impl Iterator<Item = &KernelModuleSpec> {
        self.modules.iter().rev()
    }

    /// Look up a module by name.
    #[must_use]
    pub fn get(&self, name: &ModuleName) -> Option<&KernelModuleSpec> {
        self.modules.iter().find(|spec| spec.name() == name)
    }

    /// Return the names of modules excluded from the build.
    #[must_use]
    pub fn excluded(&self) -> &[ModuleName] {
        &self.excluded
    }

    /// Return the file names every precompiled bundle must provide.
    #[must_use]
    pub fn expected_filenames(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.filename().to_owned()).collect()
    }

    /// Return the number of active modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Return true when no modules remain active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_set() -> ModuleSet {
        ModuleSet::new(vec![
            KernelModuleSpec::new("core", "core.ko"),
            KernelModuleSpec::new("modeset", "modeset.ko"),
            KernelModuleSpec::new("uvm", "uvm.ko").optional("CUDA", "no-unified-memory"),
        ])
    }

    #[test]
    fn unload_order_is_reverse_of_load_order() {
        let set = sample_set();
        let load: Vec<_> = set.iter().map(|m| m.name().as_str()).collect();
        let unload: Vec<_> = set.unload_order().map(|m| m.name().as_str()).collect();
        assert_eq!(load, ["core", "modeset", "uvm"]);
        assert_eq!(unload, ["uvm", "modeset", "core"]);
    }

    #[test]
    fn removing_a_module_records_the_exclusion_once() {
        let mut set = sample_set();
        assert!(set.remove(&ModuleName::from("uvm")));
        assert!(!set.remove(&ModuleName::from("uvm")));
        assert_eq!(set.excluded(), &[ModuleName::from("uvm")]);
        assert_eq!(set.expected_filenames(), ["core.ko", "modeset.ko"]);
    }

    #[test]
    fn disable_hint_names_the_flag() {
        let set = sample_set();
        let uvm = set.get(&ModuleName::from("uvm")).expect("uvm present");
        let hint = uvm.disable_hint().expect("optional module has hint");
        assert!(hint.contains("--disable-module no-unified-memory"));
        assert!(hint.contains("CUDA"));
    }

    #[test]
    fn kernel_name_uses_underscores() {
        assert_eq!(ModuleName::from("acme-drm").kernel_name(), "acme_drm");
    }

    #[rstest]
    #[case::self_contained("name = \"core\"\nfilename = \"core.ko\"\n", true)]
    #[case::split(
        "name = \"core\"\nfilename = \"core.ko\"\ninterface = \"core-interface.o\"\ncore_object = \"core-kernel.o\"\n",
        true
    )]
    #[case::interface_without_core(
        "name = \"core\"\nfilename = \"core.ko\"\ninterface = \"core-interface.o\"\n",
        false
    )]
    #[case::empty_interface(
        "name = \"core\"\nfilename = \"core.ko\"\ninterface = \"\"\ncore_object = \"core-kernel.o\"\n",
        false
    )]
    fn manifest_entries_enforce_interface_invariant(#[case] toml_src: &str, #[case] ok: bool) {
        let parsed: Result<KernelModuleSpec, _> = toml::from_str(toml_src);
        assert_eq!(parsed.is_ok(), ok, "{parsed:?}");
    }

    #[test]
    fn split_layout_exposes_both_files() {
        let spec = KernelModuleSpec::new("core", "core.ko")
            .with_interface("core-interface.o", "core-kernel.o")
            .expect("both files named");
        assert!(spec.has_separate_interface());
        assert_eq!(
            spec.layout(),
            &ModuleLayout::SplitInterface {
                interface: "core-interface.o".to_owned(),
                core_object: "core-kernel.o".to_owned(),
            }
        );
    }

    #[rstest]
    #[case::empty_interface("", "core-kernel.o")]
    #[case::blank_core_object("core-interface.o", "  ")]
    fn builder_rejects_blank_interface_names(#[case] interface: &str, #[case] core_object: &str) {
        let err = KernelModuleSpec::new("core", "core.ko")
            .with_interface(interface, core_object)
            .expect_err("blank name");
        assert_eq!(
            err,
            ModuleSpecError::IncompleteInterface {
                module: ModuleName::from("core"),
            }
        );
    }
}
