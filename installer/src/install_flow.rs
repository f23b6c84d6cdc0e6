//! End-to-end installation of a kernel module package.
//!
//! [`run_install`] sequences one run: take the install lock, read the
//! package manifest, pick the module type, resolve the kernel paths, then
//! either package a precompiled bundle or produce installable modules (from
//! a matching bundle when one exists and the operator accepts it, otherwise
//! from source) and load-test them against the running kernel.

use crate::artefact::extraction::ArtefactExtractor;
use crate::artefact::matcher::{FoundBundle, MatchCriteria, RootOrigin, SearchRoots, find_match};
use crate::artefact::packaging_error::PackagingError;
use crate::command::CommandExecutor;
use crate::config::{Environment, InstallOptions, PackageManifest};
use crate::error::{InstallerError, Result};
use crate::kernel::{KernelContext, SystemRoot};
use crate::load_test::classify::SIGNATURE_ENFORCEMENT_TEST;
use crate::load_test::{
    DependencyLoader, EventQueue, KernelState, LoadTestReport, LoadTestRequest, LoadTester,
    ModuleLoader, SignaturePolicy, secure_boot_enabled,
};
use crate::lock::{DEFAULT_LOCK_PATH, InstallLock};
use crate::module_spec::ModuleSet;
use crate::output::Reporter;
use crate::paths::{KernelPaths, PathOverrides, PathResolver};
use crate::pipeline::{BuildPipeline, BuildRequest, BuiltModule, PackagingRequest};
use crate::precompiled_install::PrecompiledInstaller;
use crate::prompt::{Choice, Prompter};
use crate::toolchain::{BuildLog, ToolchainRunner, ToolchainSettings};
use crate::variant::{GpuCompatibility, ModuleTypeSelector, Variant};
use camino::{Utf8Path, Utf8PathBuf};

/// File in the package directory receiving the build log.
pub const BUILD_LOG_NAME: &str = "kmodsmith-build.log";

/// Collaborators touching the running kernel during the load test.
#[derive(Clone, Copy)]
pub struct LoadTestSystem<'a> {
    /// Inserts and removes modules.
    pub loader: &'a dyn ModuleLoader,
    /// Reads and adjusts kernel state.
    pub state: &'a dyn KernelState,
    /// Device event queue control.
    pub queue: &'a dyn EventQueue,
    /// Loads dependency modules.
    pub deps: &'a dyn DependencyLoader,
}

/// Everything a run needs from its surroundings.
#[derive(Clone, Copy)]
pub struct InstallContext<'a> {
    /// Root for kernel pseudo files and distribution directories.
    pub root: &'a SystemRoot,
    /// The target kernel.
    pub kernel: &'a KernelContext,
    /// Environment overrides.
    pub env: &'a Environment,
    /// Runs external tools.
    pub executor: &'a dyn CommandExecutor,
    /// Asks the operator questions.
    pub prompter: &'a dyn Prompter,
    /// Unpacks precompiled bundles.
    pub extractor: &'a dyn ArtefactExtractor,
    /// Load-test collaborators.
    pub load_test: LoadTestSystem<'a>,
}

/// Where the installed modules came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    /// A precompiled bundle from the given root.
    Precompiled(RootOrigin),
    /// A build from source.
    Built,
}

/// What a run produced.
#[derive(Debug)]
pub enum InstallSummary {
    /// Modules are ready in the package's build directory.
    Installed {
        /// Directory holding the modules.
        destination: Utf8PathBuf,
        /// The modules, in load order.
        modules: Vec<BuiltModule>,
        /// How they were produced.
        source: ModuleSource,
        /// Load-test result; `None` when the test was skipped.
        load_test: Option<LoadTestReport>,
    },
    /// A precompiled bundle was written.
    Packaged {
        /// The bundle archive.
        archive: Utf8PathBuf,
        /// Number of artefacts it holds.
        artefacts: usize,
    },
}

/// Run one installation.
///
/// # Errors
///
/// Returns the first fatal failure of any stage; the error's
/// [`recovery_hint`](crate::error::InstallerError::recovery_hint) names the
/// remediation.
pub fn run_install(
    options: &InstallOptions,
    context: &InstallContext<'_>,
    reporter: &mut Reporter<'_>,
) -> Result<InstallSummary> {
    let lock_path = options
        .lock_path
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_LOCK_PATH));
    let _lock = InstallLock::acquire(&lock_path)?;

    let package_dir = options.package_dir.as_path();
    let manifest = PackageManifest::load(package_dir)?;
    log::info!("installing {} {}", manifest.name, manifest.version);

    let compatibility = GpuCompatibility::detect(context.root, &manifest.gpu);
    let selector = ModuleTypeSelector::new(package_dir, compatibility);
    let variant = selector.select(options.module_type.as_ref())?;
    let build_dir = selector.build_dir(variant);
    reporter.line(format!(
        "Using the {} kernel modules from {build_dir}",
        variant.module_type
    ));
    let modules = manifest.module_set(&options.disabled_modules);

    let paths = resolve_paths(options, context)?;
    let settings = ToolchainSettings {
        compiler: context.env.compiler(&manifest.tools).to_owned(),
        arch: context.kernel.kbuild_arch().to_owned(),
        make: manifest.tools.make.clone(),
        jobs: options.concurrency.max(1),
        ignore_cc_mismatch: options.ignore_cc_mismatch,
    };
    let mut runner = ToolchainRunner::new(context.executor, settings, paths);

    if let Some(output_dir) = options.package_precompiled.as_deref() {
        return package_precompiled(
            &mut runner,
            context,
            &manifest,
            options,
            (variant, build_dir.as_path()),
            modules,
            output_dir,
            reporter,
        );
    }

    let found = search_precompiled(options, context, &manifest, &modules)
        .filter(|found| accept_bundle(context.prompter, found));
    let (modules, built, source) = match found {
        Some(found) => {
            reporter.line(format!(
                "Installing from the {} precompiled bundle {}",
                found.origin,
                found.bundle.path()
            ));
            let built = PrecompiledInstaller::new(
                &mut runner,
                context.prompter,
                context.extractor,
                &manifest.tools.linker,
            )
            .install(&found.bundle, package_dir, &modules)?;
            (modules, built, ModuleSource::Precompiled(found.origin))
        }
        None => {
            let (modules, built) = build_from_source(
                &mut runner,
                context,
                &manifest,
                options,
                (variant, build_dir.as_path()),
                modules,
                reporter,
            )?;
            (modules, built, ModuleSource::Built)
        }
    };

    let load_test = if options.skip_load_test {
        log::info!("skipping the load test as requested");
        None
    } else if !context.kernel.is_running() {
        reporter.line(format!(
            "Skipping the load test: kernel {} is not the running kernel",
            context.kernel.release()
        ));
        None
    } else {
        reporter.line("Testing that the kernel modules load");
        let policy = signature_policy(&mut runner, context.root, &build_dir);
        let report = LoadTester::new(
            context.load_test.loader,
            context.load_test.state,
            context.load_test.queue,
            context.load_test.deps,
            context.prompter,
        )
        .with_policy(policy)
        .test_load(&LoadTestRequest {
            package_name: &manifest.name,
            modules: &modules,
            built: &built,
            preload: &manifest.preload,
            parameters: &manifest.module_parameters,
        })?;
        report_load_test(&report, reporter);
        Some(report)
    };

    Ok(InstallSummary::Installed {
        destination: build_dir,
        modules: built,
        source,
        load_test,
    })
}

fn resolve_paths(options: &InstallOptions, context: &InstallContext<'_>) -> Result<KernelPaths> {
    let mut resolver = PathResolver::new(context.root, context.env, context.kernel.release());
    if !options.no_questions {
        resolver = resolver.interactive(context.prompter);
    }
    resolver.resolve(PathOverrides {
        source: options.kernel_source_path.as_deref(),
        include: options.kernel_include_path.as_deref(),
        output: options.kernel_output_path.as_deref(),
    })
}

fn search_precompiled(
    options: &InstallOptions,
    context: &InstallContext<'_>,
    manifest: &PackageManifest,
    modules: &ModuleSet,
) -> Option<FoundBundle> {
    if options.skip_precompiled {
        log::info!("precompiled bundle search disabled");
        return None;
    }
    // Bundles are matched on the running kernel's signature.
    if !context.kernel.is_running() {
        log::info!("not searching for precompiled bundles: the target kernel is not running");
        return None;
    }
    let roots = SearchRoots::standard(
        options.precompiled_path.as_deref(),
        context.root,
        context.kernel.release(),
        &options.package_dir,
    );
    let expected = modules.expected_filenames();
    let found = find_match(
        &roots,
        &MatchCriteria {
            proc_version: context.kernel.proc_version(),
            driver_version: &manifest.version,
            expected_filenames: &expected,
        },
    );
    if found.is_none() {
        log::info!("no precompiled bundle matches this kernel; building from source");
    }
    found
}

fn accept_bundle(prompter: &dyn Prompter, found: &FoundBundle) -> bool {
    let question = format!(
        "A precompiled bundle for this kernel was found in the {} directory ({}). Install the kernel modules from it instead of building them from source?",
        found.origin,
        found.bundle.path()
    );
    match prompter.choose(
        &question,
        "Use the precompiled bundle",
        "Build from source",
        Choice::Proceed,
    ) {
        Choice::Proceed => true,
        Choice::Abort => {
            log::info!("precompiled bundle {} declined; building from source", found.bundle.path());
            false
        }
    }
}

fn build_from_source(
    runner: &mut ToolchainRunner<'_>,
    context: &InstallContext<'_>,
    manifest: &PackageManifest,
    options: &InstallOptions,
    (variant, build_dir): (&Variant, &Utf8Path),
    mut modules: ModuleSet,
    reporter: &mut Reporter<'_>,
) -> Result<(ModuleSet, Vec<BuiltModule>)> {
    reporter.line(format!("Building kernel modules for {}", context.kernel.release()));
    let result = BuildPipeline::new(runner, context.kernel, context.root, context.prompter).run(
        BuildRequest {
            source_dir: build_dir,
            target_dir: variant.directory,
            modules: modules.clone(),
            signing: &options.signing,
            linker: &manifest.tools.linker,
            packaging: None,
        },
        reporter,
    );
    save_build_log(runner.log(), &options.package_dir.join(BUILD_LOG_NAME));

    let outcome = result?;
    for name in &outcome.skipped {
        modules.remove(name);
    }
    Ok((modules, outcome.built))
}

#[expect(clippy::too_many_arguments, reason = "one call site sequencing the run")]
fn package_precompiled(
    runner: &mut ToolchainRunner<'_>,
    context: &InstallContext<'_>,
    manifest: &PackageManifest,
    options: &InstallOptions,
    (variant, build_dir): (&Variant, &Utf8Path),
    modules: ModuleSet,
    output_dir: &Utf8Path,
    reporter: &mut Reporter<'_>,
) -> Result<InstallSummary> {
    reporter.line(format!(
        "Packaging precompiled kernel modules for {}",
        context.kernel.release()
    ));
    let result = BuildPipeline::new(runner, context.kernel, context.root, context.prompter).run(
        BuildRequest {
            source_dir: build_dir,
            target_dir: variant.directory,
            modules,
            signing: &options.signing,
            linker: &manifest.tools.linker,
            packaging: Some(PackagingRequest {
                output_dir,
                package_name: &manifest.name,
                driver_version: &manifest.version,
            }),
        },
        reporter,
    );
    save_build_log(runner.log(), &output_dir.join(BUILD_LOG_NAME));

    let bundle = result?
        .bundle
        .ok_or(InstallerError::Packaging(PackagingError::EmptyArtefactList))?;
    Ok(InstallSummary::Packaged {
        artefacts: bundle.manifest.artefacts.len(),
        archive: bundle.archive_path,
    })
}

/// Check how strictly the running kernel checks module signatures.
fn signature_policy(
    runner: &mut ToolchainRunner<'_>,
    root: &SystemRoot,
    build_dir: &Utf8Path,
) -> SignaturePolicy {
    let signatures_enforced = match runner.run_feature_test(build_dir, SIGNATURE_ENFORCEMENT_TEST, &[])
    {
        Ok(result) => result.passed,
        Err(err) => {
            log::warn!("unable to check module signature enforcement: {err}");
            false
        }
    };
    SignaturePolicy {
        secure_boot: secure_boot_enabled(root),
        signatures_enforced,
    }
}

fn report_load_test(report: &LoadTestReport, reporter: &mut Reporter<'_>) {
    if report.retried {
        log::info!("the load test passed after pausing the device event queue");
    }
    for warning in &report.warnings {
        reporter.always(format!("Warning from the kernel module ({}): {}", warning.name, warning.text));
    }
    for failure in &report.optional_failures {
        reporter.always(format!(
            "Optional kernel module {} failed to load: {}",
            failure.module, failure.reason
        ));
        if let Some(hint) = &failure.hint {
            reporter.always(format!("  {hint}"));
        }
    }
    if report.skip_future_load_tests {
        reporter.always(
            "The kernel did not accept the module signature; the modules were installed without a successful load test.",
        );
    }
}

fn save_build_log(log: &BuildLog, path: &Utf8Path) {
    if log.is_empty() {
        return;
    }
    match std::fs::write(path, log.as_str()) {
        Ok(()) => log::info!("build log written to {path}"),
        Err(err) => log::warn!("unable to write the build log to {path}: {err}"),
    }
}

#[cfg(test)]
#[path = "install_flow_tests.rs"]
mod tests;
