//! Installation from a matched precompiled bundle.
//!
//! A bundle replaces the build: it is unpacked into a scratch directory,
//! interface artefacts are linked against the core object shipped in the
//! package and get their detached signature reattached, and complete
//! modules are copied as they are. The resulting modules land in the module
//! type's build directory, where a source build would have put them.

use crate::artefact::bundle::{PrecompiledBundle, UnpackedArtefact};
use crate::artefact::extraction::ArtefactExtractor;
use crate::artefact::kind::ArtefactKind;
use crate::error::{InstallerError, Result};
use crate::module_spec::{KernelModuleSpec, ModuleSet};
use crate::pipeline::BuiltModule;
use crate::prompt::Prompter;
use crate::signing::{AttachOutcome, attach_detached_signature, link_module};
use crate::toolchain::ToolchainRunner;
use camino::{Utf8Path, Utf8PathBuf};

/// Installs modules from a precompiled bundle.
pub struct PrecompiledInstaller<'a, 'r> {
    runner: &'r mut ToolchainRunner<'a>,
    prompter: &'r dyn Prompter,
    extractor: &'r dyn ArtefactExtractor,
    linker: &'r str,
}

impl<'a, 'r> PrecompiledInstaller<'a, 'r> {
    /// Create an installer linking with `linker`.
    pub fn new(
        runner: &'r mut ToolchainRunner<'a>,
        prompter: &'r dyn Prompter,
        extractor: &'r dyn ArtefactExtractor,
        linker: &'r str,
    ) -> Self {
        Self {
            runner,
            prompter,
            extractor,
            linker,
        }
    }

    /// Produce every module of `modules` from `bundle`.
    ///
    /// Each module is written to `package_dir/<target dir>/<module file>`.
    /// Modules are returned in load order.
    ///
    /// # Errors
    ///
    /// Returns an error when the bundle fails verification, a module is
    /// missing from it, linking fails, or the operator aborts over a
    /// signature that cannot be reattached.
    pub fn install(
        &mut self,
        bundle: &PrecompiledBundle,
        package_dir: &Utf8Path,
        modules: &ModuleSet,
    ) -> Result<Vec<BuiltModule>> {
        let scratch = tempfile::Builder::new()
            .prefix("kmodsmith-precompiled-")
            .tempdir()?;
        let scratch_path = Utf8PathBuf::try_from(scratch.path().to_path_buf())
            .map_err(|err| InstallerError::Io(err.into_io_error()))?;
        let unpacked = bundle.unpack(self.extractor, &scratch_path)?;
        log::info!(
            "unpacked {} artefacts from {}",
            unpacked.len(),
            bundle.path()
        );

        let mut installed = Vec::with_capacity(modules.len());
        for spec in modules.iter() {
            let entry = unpacked
                .iter()
                .find(|entry| entry.artefact.module_filename() == spec.filename())
                .ok_or_else(|| InstallerError::ModuleBuildFailed {
                    module: spec.name().clone(),
                    reason: format!("{} provides no artefact for {}", bundle.path(), spec.filename()),
                })?;
            installed.push(self.install_artefact(spec, entry, package_dir)?);
        }
        Ok(installed)
    }

    fn install_artefact(
        &mut self,
        spec: &KernelModuleSpec,
        entry: &UnpackedArtefact,
        package_dir: &Utf8Path,
    ) -> Result<BuiltModule> {
        let artefact = &entry.artefact;
        let dest_dir = package_dir.join(artefact.target_dir());
        let dest = dest_dir.join(artefact.module_filename());
        std::fs::create_dir_all(&dest_dir)?;

        let signed = match artefact.kind() {
            ArtefactKind::Interface { core_object } => {
                let core = dest_dir.join(core_object);
                if !core.is_file() {
                    return Err(InstallerError::ModuleBuildFailed {
                        module: spec.name().clone(),
                        reason: format!("the core object {core} is missing from the package"),
                    });
                }
                link_module(self.runner, self.linker, &entry.payload_path, &core, &dest)?;
                let outcome = attach_detached_signature(&dest, artefact, self.prompter)?;
                outcome == AttachOutcome::Signed
            }
            ArtefactKind::Module => {
                std::fs::copy(&entry.payload_path, &dest)?;
                artefact.has_embedded_signature()
            }
        };
        log::debug!("installed precompiled {dest} (signed: {signed})");

        Ok(BuiltModule {
            name: spec.name().clone(),
            path: dest,
            signed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artefact::crc::crc32;
    use crate::artefact::extraction::ZstdExtractor;
    use crate::artefact::precompiled::{DetachedSignature, PrecompiledArtefact};
    use crate::paths::KernelPaths;
    use crate::prompt::{Choice, MockPrompter};
    use crate::test_utils::{ExpectedCall, StubExecutor, utf8_temp_dir, write_bundle, write_file};
    use crate::toolchain::ToolchainSettings;

    const SIGNATURE: &str = "Linux version 6.8.0";

    fn settings() -> ToolchainSettings {
        ToolchainSettings {
            compiler: "cc".to_owned(),
            arch: "x86_64".to_owned(),
            make: "make".to_owned(),
            jobs: 1,
            ignore_cc_mismatch: false,
        }
    }

    fn kernel_paths() -> KernelPaths {
        KernelPaths {
            source: Utf8PathBuf::from("/usr/src/linux"),
            output: Utf8PathBuf::from("/usr/src/linux"),
        }
    }

    fn modules() -> ModuleSet {
        ModuleSet::new(vec![
            KernelModuleSpec::new("core", "core.ko")
                .with_interface("core-interface.o", "core-kernel.o")
                .expect("split layout"),
            KernelModuleSpec::new("uvm", "uvm.ko"),
        ])
    }

    fn artefacts(signature_crc: u32) -> Vec<PrecompiledArtefact> {
        let mut interface = PrecompiledArtefact::for_module(
            &KernelModuleSpec::new("core", "core.ko")
                .with_interface("core-interface.o", "core-kernel.o")
                .expect("split layout"),
            "kernel",
        );
        interface.set_detached_signature(DetachedSignature {
            crc: signature_crc,
            signature: b"~SIG~".to_vec(),
        });
        let mut module =
            PrecompiledArtefact::for_module(&KernelModuleSpec::new("uvm", "uvm.ko"), "kernel");
        module.mark_embedded_signature();
        vec![interface, module]
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        package_dir: Utf8PathBuf,
        bundle: PrecompiledBundle,
    }

    fn fixture(signature_crc: u32, with_core: bool) -> Fixture {
        let (temp, root) = utf8_temp_dir();
        let package_dir = root.join("package");
        if with_core {
            write_file(&package_dir, "kernel/core-kernel.o", "core");
        }
        let path = write_bundle(&root, "acme.tar.zst", SIGNATURE, "1.0", artefacts(signature_crc));
        let bundle = PrecompiledBundle::open(&path).expect("open bundle");
        Fixture {
            _temp: temp,
            package_dir,
            bundle,
        }
    }

    fn link_call(fixture: &Fixture) -> ExpectedCall {
        let dest = fixture.package_dir.join("kernel/core.ko");
        ExpectedCall::new("ld", ["-r -o", dest.as_str(), "core-interface.o", "core-kernel.o"])
            .creates(dest, b"LINKED")
    }

    #[test]
    fn links_interface_reattaches_signature_and_copies_modules() {
        let fixture = fixture(crc32(b"LINKED"), true);
        let executor = StubExecutor::new(vec![link_call(&fixture)]);
        let mut runner = ToolchainRunner::new(&executor, settings(), kernel_paths());
        let prompter = MockPrompter::new();

        let installed =
            PrecompiledInstaller::new(&mut runner, &prompter, &ZstdExtractor, "ld")
                .install(&fixture.bundle, &fixture.package_dir, &modules())
                .expect("install");

        assert_eq!(installed.len(), 2);
        assert!(installed.iter().all(|module| module.signed));
        assert_eq!(
            std::fs::read(&installed[0].path).expect("core.ko"),
            b"LINKED~SIG~"
        );
        assert_eq!(
            std::fs::read_to_string(&installed[1].path).expect("uvm.ko"),
            "uvm.ko"
        );
        executor.assert_finished();
    }

    #[test]
    fn crc_mismatch_aborts_when_operator_declines() {
        let fixture = fixture(crc32(b"LINKED WITH ANOTHER TOOLCHAIN"), true);
        let executor = StubExecutor::new(vec![link_call(&fixture)]);
        let mut runner = ToolchainRunner::new(&executor, settings(), kernel_paths());
        let mut prompter = MockPrompter::new();
        prompter
            .expect_choose()
            .times(1)
            .return_const(Choice::Abort);

        let err = PrecompiledInstaller::new(&mut runner, &prompter, &ZstdExtractor, "ld")
            .install(&fixture.bundle, &fixture.package_dir, &modules())
            .expect_err("operator aborts");

        assert!(matches!(err, InstallerError::Aborted { .. }), "unexpected error: {err}");
    }

    #[test]
    fn missing_core_object_is_reported_before_linking() {
        let fixture = fixture(crc32(b"LINKED"), false);
        let executor = StubExecutor::new(Vec::new());
        let mut runner = ToolchainRunner::new(&executor, settings(), kernel_paths());
        let prompter = MockPrompter::new();

        let err = PrecompiledInstaller::new(&mut runner, &prompter, &ZstdExtractor, "ld")
            .install(&fixture.bundle, &fixture.package_dir, &modules())
            .expect_err("core object missing");

        assert!(
            matches!(err, InstallerError::ModuleBuildFailed { ref reason, .. } if reason.contains("core-kernel.o")),
            "unexpected error: {err}"
        );
        executor.assert_finished();
    }
}
