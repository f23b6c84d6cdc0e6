//! Build pipeline orchestration.
//!
//! One pipeline run takes a module type's build directory from kernel
//! configuration checks to built (and optionally packaged) modules:
//!
//! 1. conflict check against the target kernel's configuration
//! 2. staging into a temporary directory when packaging
//! 3. sanity feature tests
//! 4. `clean` followed by a full build with progress estimation
//! 5. per-module verification with a targeted rebuild of missing modules
//! 6. aggregate build status check
//! 7. packaging into a precompiled bundle, when requested
//! 8. removal of the staging directory
//!
//! Every step exits early on failure. The staging directory is a
//! [`tempfile::TempDir`] owned by the run, so it is removed on every path.

use crate::artefact::packaging::{
    BundleParams, PackageOutput, PackagedFile, bundle_file_name, package_bundle,
};
use crate::artefact::precompiled::PrecompiledArtefact;
use crate::config::SigningOptions;
use crate::error::{InstallerError, Result};
use crate::kernel::{KernelContext, SystemRoot};
use crate::module_spec::{KernelModuleSpec, ModuleLayout, ModuleName, ModuleSet};
use crate::output::Reporter;
use crate::prompt::{Choice, Prompter};
use crate::signing::{Signer, link_and_detach_signature};
use crate::toolchain::{BuildLog, BuildProgress, ToolchainRunner};
use camino::{Utf8Path, Utf8PathBuf};

/// Feature tests run before every build, in order.
pub const SANITY_CHECKS: [&str; 6] = [
    "cc_sanity_check",
    "cc_version_check",
    "dom0_sanity_check",
    "xen_sanity_check",
    "preempt_rt_sanity_check",
    "vgpu_kvm_sanity_check",
];

/// Memory hotplug auto-online policy, relative to the system root.
pub const AUTO_ONLINE_POLICY: &str = "sys/devices/system/memory/auto_online_blocks";

const BUILD_TARGET: &str = "modules";
const CLEAN_TARGET: &str = "clean";

/// A module produced by a build or unpacked from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltModule {
    /// Module name.
    pub name: ModuleName,
    /// Path of the module file.
    pub path: Utf8PathBuf,
    /// True when the module carries a signature.
    pub signed: bool,
}

/// Result of one pipeline run.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Number of modules successfully produced.
    pub modules_built: usize,
    /// Modules ready to install, in load order. Empty when packaging, since
    /// the staging directory does not outlive the run.
    pub built: Vec<BuiltModule>,
    /// Optional modules dropped because they failed to build.
    pub skipped: Vec<ModuleName>,
    /// The written bundle, when packaging was requested.
    pub bundle: Option<PackageOutput>,
    /// Output of every toolchain invocation in the run.
    pub log: BuildLog,
}

/// Where and how to write a precompiled bundle.
#[derive(Debug, Clone, Copy)]
pub struct PackagingRequest<'a> {
    /// Directory receiving the bundle.
    pub output_dir: &'a Utf8Path,
    /// Package name used in the bundle file name.
    pub package_name: &'a str,
    /// Driver version recorded in the bundle.
    pub driver_version: &'a str,
}

/// Inputs of one pipeline run.
pub struct BuildRequest<'a> {
    /// The module type's build directory inside the package.
    pub source_dir: &'a Utf8Path,
    /// Name of that directory, recorded as the artefacts' target directory.
    pub target_dir: &'a str,
    /// Modules to build, in load order.
    pub modules: ModuleSet,
    /// Signing configuration.
    pub signing: &'a SigningOptions,
    /// Linker used to join interface and core objects.
    pub linker: &'a str,
    /// Packaging request; `None` builds in place for installation.
    pub packaging: Option<PackagingRequest<'a>>,
}

/// Runs the build pipeline against one kernel.
pub struct BuildPipeline<'a, 'r> {
    runner: &'r mut ToolchainRunner<'a>,
    kernel: &'r KernelContext,
    root: &'r SystemRoot,
    prompter: &'r dyn Prompter,
}

impl<'a, 'r> BuildPipeline<'a, 'r> {
    /// Create a pipeline driving `runner`.
    pub fn new(
        runner: &'r mut ToolchainRunner<'a>,
        kernel: &'r KernelContext,
        root: &'r SystemRoot,
        prompter: &'r dyn Prompter,
    ) -> Self {
        Self {
            runner,
            kernel,
            root,
            prompter,
        }
    }

    /// Run every pipeline step for `request`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. The build log accumulated up
    /// to the failure stays available through the runner.
    pub fn run(
        &mut self,
        request: BuildRequest<'_>,
        reporter: &mut Reporter<'_>,
    ) -> Result<BuildOutcome> {
        let BuildRequest {
            source_dir,
            target_dir,
            mut modules,
            signing,
            linker,
            packaging,
        } = request;

        self.check_configuration_conflicts()?;

        let stage = match packaging {
            Some(_) => Some(stage_sources(source_dir)?),
            None => None,
        };
        let build_dir = match &stage {
            Some((_, path)) => path.clone(),
            None => source_dir.to_owned(),
        };

        reporter.line("Performing kernel sanity checks");
        self.run_sanity_checks(&build_dir)?;

        let signer = if signing.is_requested() {
            Some(Signer::prepare(signing, self.runner, &build_dir)?)
        } else {
            None
        };

        let status = self.clean_and_build(&build_dir, &modules, reporter)?;
        let skipped = self.verify_modules(&build_dir, &mut modules, reporter)?;
        let status = if skipped.is_empty() {
            status
        } else {
            self.rebuild_without(&build_dir, &modules)?
        };
        if status != 0 {
            return Err(InstallerError::BuildFailed { status });
        }

        let outcome = match packaging {
            Some(request) => {
                let bundle = self.package(
                    &build_dir,
                    target_dir,
                    &modules,
                    signer.as_ref(),
                    linker,
                    request,
                )?;
                BuildOutcome {
                    modules_built: modules.len(),
                    built: Vec::new(),
                    skipped,
                    bundle: Some(bundle),
                    log: self.runner.log().clone(),
                }
            }
            None => {
                let built = self.finish_in_place(&build_dir, &modules, signer.as_ref())?;
                BuildOutcome {
                    modules_built: built.len(),
                    built,
                    skipped,
                    bundle: None,
                    log: self.runner.log().clone(),
                }
            }
        };
        drop(stage);
        Ok(outcome)
    }

    /// Refuse kernels whose configuration conflicts with the package unless
    /// the operator insists.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::ConfigurationConflict`] when the operator
    /// declines to continue.
    pub fn check_configuration_conflicts(&self) -> Result<()> {
        let Some(reason) = self.configuration_conflict() else {
            return Ok(());
        };
        log::warn!("{reason}");
        match self.prompter.choose(
            &format!("{reason}. Continue installation anyway?"),
            "Continue installation",
            "Abort installation",
            Choice::Abort,
        ) {
            Choice::Proceed => {
                log::warn!("continuing despite configuration conflict at the operator's request");
                Ok(())
            }
            Choice::Abort => Err(InstallerError::ConfigurationConflict { reason }),
        }
    }

    fn configuration_conflict(&self) -> Option<String> {
        if !self.kernel.is_powerpc() {
            return None;
        }
        let policy = match self.root.read_trimmed(AUTO_ONLINE_POLICY) {
            Ok(policy) => policy,
            Err(err) => {
                log::debug!("unable to read {AUTO_ONLINE_POLICY}: {err}");
                return None;
            }
        };
        (policy != "offline").then(|| {
            format!(
                "the kernel onlines hot-plugged memory automatically (auto_online_blocks is \
                 '{policy}'), which conflicts with device memory onlining on this platform"
            )
        })
    }

    fn run_sanity_checks(&mut self, build_dir: &Utf8Path) -> Result<()> {
        for test in SANITY_CHECKS {
            let result = self.runner.run_feature_test(build_dir, test, &[])?;
            if !result.passed {
                log::error!("sanity check {test} failed");
                return Err(InstallerError::SanityCheckFailed {
                    test: test.to_owned(),
                    message: result.message,
                });
            }
            log::debug!("sanity check {test} passed");
        }
        Ok(())
    }

    fn clean_and_build(
        &mut self,
        build_dir: &Utf8Path,
        modules: &ModuleSet,
        reporter: &mut Reporter<'_>,
    ) -> Result<i32> {
        let excluded = modules.excluded();
        let clean = self.runner.run_build(build_dir, CLEAN_TARGET, excluded, &[], None)?;
        if !clean.success() {
            return Err(InstallerError::ToolFailed {
                command: format!("make -C {build_dir} {CLEAN_TARGET}"),
                status: clean.status,
                output: clean.message(),
            });
        }

        let plan = self.runner.count_build_steps(build_dir, excluded);
        reporter.line(format_args!("Building kernel modules in {build_dir}"));
        let outcome = self.runner.run_build(
            build_dir,
            BUILD_TARGET,
            excluded,
            &[],
            Some(BuildProgress {
                label: "Building kernel modules",
                plan: &plan,
                sink: &mut *reporter,
            }),
        )?;
        if !outcome.success() {
            log::warn!("kernel module build exited with status {}", outcome.status);
        }
        Ok(outcome.status)
    }

    /// Check every expected module exists, rebuilding missing ones alone.
    ///
    /// Returns the optional modules that were dropped.
    fn verify_modules(
        &mut self,
        build_dir: &Utf8Path,
        modules: &mut ModuleSet,
        reporter: &mut Reporter<'_>,
    ) -> Result<Vec<ModuleName>> {
        let mut skipped = Vec::new();
        let specs: Vec<KernelModuleSpec> = modules.iter().cloned().collect();
        for spec in specs {
            let path = build_dir.join(spec.filename());
            if path.is_file() {
                continue;
            }
            log::warn!("{} was not built; rebuilding {} on its own", spec.filename(), spec.name());
            let vars = [format!("KERNEL_MODULES={}", spec.name())];
            let rebuilt = self.runner.run_build(
                build_dir,
                BUILD_TARGET,
                modules.excluded(),
                &vars,
                None,
            )?;
            if path.is_file() {
                continue;
            }

            let reason = format!(
                "targeted rebuild exited with status {}; see the build log",
                rebuilt.status
            );
            let Some(hint) = spec.disable_hint() else {
                return Err(InstallerError::ModuleBuildFailed {
                    module: spec.name().clone(),
                    reason,
                });
            };
            log::warn!("optional module {} failed to build: {reason}", spec.name());
            reporter.line(format_args!(
                "Skipping optional module {}: it failed to build. {hint}",
                spec.name()
            ));
            modules.remove(spec.name());
            skipped.push(spec.name().clone());
        }
        Ok(skipped)
    }

    /// Rebuild with failed optional modules excluded, so the aggregate status
    /// reflects only the modules that will be installed.
    fn rebuild_without(&mut self, build_dir: &Utf8Path, modules: &ModuleSet) -> Result<i32> {
        let outcome =
            self.runner
                .run_build(build_dir, BUILD_TARGET, modules.excluded(), &[], None)?;
        Ok(outcome.status)
    }

    fn finish_in_place(
        &mut self,
        build_dir: &Utf8Path,
        modules: &ModuleSet,
        signer: Option<&Signer>,
    ) -> Result<Vec<BuiltModule>> {
        let mut built = Vec::with_capacity(modules.len());
        for spec in modules.iter() {
            let path = build_dir.join(spec.filename());
            if let Some(signer) = signer {
                signer.sign(self.runner, &path)?;
            }
            built.push(BuiltModule {
                name: spec.name().clone(),
                path,
                signed: signer.is_some(),
            });
        }
        Ok(built)
    }

    fn package(
        &mut self,
        build_dir: &Utf8Path,
        target_dir: &str,
        modules: &ModuleSet,
        signer: Option<&Signer>,
        linker: &str,
        request: PackagingRequest<'_>,
    ) -> Result<PackageOutput> {
        let mut artefacts = Vec::with_capacity(modules.len());
        for spec in modules.iter() {
            let mut artefact = PrecompiledArtefact::for_module(spec, target_dir);
            let payload_path = build_dir.join(artefact.payload());
            match spec.layout() {
                ModuleLayout::SplitInterface { interface, .. } => {
                    let outcome = self.runner.run_build(
                        build_dir,
                        interface,
                        modules.excluded(),
                        &[],
                        None,
                    )?;
                    if !outcome.success() || !payload_path.is_file() {
                        return Err(InstallerError::ModuleBuildFailed {
                            module: spec.name().clone(),
                            reason: format!("the interface {interface} could not be built"),
                        });
                    }
                    if let Some(signer) = signer {
                        link_and_detach_signature(
                            self.runner,
                            signer,
                            linker,
                            build_dir,
                            &mut artefact,
                        )?;
                    }
                }
                ModuleLayout::SelfContained => {
                    if let Some(signer) = signer {
                        signer.sign(self.runner, &payload_path)?;
                        artefact.mark_embedded_signature();
                    }
                }
            }
            artefacts.push(PackagedFile {
                artefact,
                payload_path,
            });
        }

        let params = BundleParams {
            description: format!(
                "{} {} {}",
                self.kernel.release(),
                std::env::consts::OS,
                self.kernel.machine()
            ),
            proc_version: self.kernel.proc_version().to_owned(),
            driver_version: request.driver_version.to_owned(),
            artefacts,
            archive_path: request.output_dir.join(bundle_file_name(
                request.package_name,
                request.driver_version,
                self.kernel.release(),
            )),
        };
        Ok(package_bundle(&params)?)
    }
}

/// Copy `source_dir` into a fresh temporary directory.
fn stage_sources(source_dir: &Utf8Path) -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let temp = tempfile::Builder::new().prefix("kmodsmith-build-").tempdir()?;
    let stage = Utf8PathBuf::try_from(temp.path().to_path_buf())
        .map_err(|err| InstallerError::Io(err.into_io_error()))?;
    copy_tree(source_dir, &stage)?;
    log::debug!("staged {source_dir} into {stage}");
    Ok((temp, stage))
}

fn copy_tree(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in from.read_dir_utf8()? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
