//! The load-test state machine.
//!
//! One attempt pauses the event queue when asked, preloads dependencies,
//! clears any stale copy of the package's modules, inserts every module in
//! load order, collects the warnings they registered, and then undoes all
//! of it: queue resumed, modules removed in reverse, console log level
//! restored, kernel log captured, and only the dependencies this attempt
//! loaded removed again. Cleanup runs whatever the insertion outcome.
//!
//! An attempt that finds a module already present was most likely raced by
//! the device event daemon auto-loading it, so [`LoadTester::test_load`]
//! retries exactly once with the queue paused.

use super::classify::{FailureDecision, SignaturePolicy, classify_failure};
use super::loader::ModuleLoader;
use super::system::{DependencyLoader, EventQueue, KernelState, LogLevelGuard, ModuleWarning};
use crate::error::{InstallerError, Result};
use crate::module_spec::{ModuleName, ModuleSet};
use crate::pipeline::BuiltModule;
use crate::prompt::Prompter;
use nix::errno::Errno;

/// Console log level kept during the test: alerts only.
const QUIET_CONSOLE_LEVEL: &str = "1";

/// Kernel log lines captured for diagnostics.
const KERNEL_LOG_LINES: usize = 25;

/// What to load and how.
#[derive(Debug, Clone, Copy)]
pub struct LoadTestRequest<'r> {
    /// Package name, naming the module warnings directory.
    pub package_name: &'r str,
    /// Modules in load order.
    pub modules: &'r ModuleSet,
    /// Built module files.
    pub built: &'r [BuiltModule],
    /// Dependencies loaded before the package's modules.
    pub preload: &'r [String],
    /// Parameters passed to every module.
    pub parameters: &'r str,
}

/// An optional module that failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalLoadFailure {
    /// The module.
    pub module: ModuleName,
    /// Why it failed.
    pub reason: String,
    /// How to leave it out of the installation.
    pub hint: Option<String>,
}

/// Result of a passing load test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadTestReport {
    /// The operator accepted a module the kernel refused to load.
    pub skip_future_load_tests: bool,
    /// Warnings the loaded modules registered.
    pub warnings: Vec<ModuleWarning>,
    /// Tail of the kernel log after the test.
    pub kernel_log: String,
    /// Optional modules that failed to load.
    pub optional_failures: Vec<OptionalLoadFailure>,
    /// The test was repeated with the event queue paused.
    pub retried: bool,
}

enum AttemptOutcome {
    Passed,
    AlreadyLoaded(ModuleName),
    Failed(InstallerError),
}

/// Loads built modules into the running kernel and unloads them again.
pub struct LoadTester<'a> {
    loader: &'a dyn ModuleLoader,
    state: &'a dyn KernelState,
    queue: &'a dyn EventQueue,
    deps: &'a dyn DependencyLoader,
    prompter: &'a dyn Prompter,
    policy: SignaturePolicy,
}

impl<'a> LoadTester<'a> {
    /// Create a tester from its collaborators.
    #[must_use]
    pub fn new(
        loader: &'a dyn ModuleLoader,
        state: &'a dyn KernelState,
        queue: &'a dyn EventQueue,
        deps: &'a dyn DependencyLoader,
        prompter: &'a dyn Prompter,
    ) -> Self {
        Self {
            loader,
            state,
            queue,
            deps,
            prompter,
            policy: SignaturePolicy::default(),
        }
    }

    /// Use `policy` when classifying insertion failures.
    #[must_use]
    pub fn with_policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Test that every module of `request` loads.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of a required module, or
    /// [`InstallerError::LoadFailed`] when a module is still found loaded
    /// after the retry with the event queue paused.
    pub fn test_load(&self, request: &LoadTestRequest<'_>) -> Result<LoadTestReport> {
        let (outcome, report) = self.attempt(request, false);
        let module = match outcome {
            AttemptOutcome::Passed => return Ok(report),
            AttemptOutcome::Failed(err) => return Err(err),
            AttemptOutcome::AlreadyLoaded(module) => module,
        };

        log::warn!("{module} was loaded while the test ran; retrying with the event queue paused");
        let (outcome, mut report) = self.attempt(request, true);
        report.retried = true;
        match outcome {
            AttemptOutcome::Passed => Ok(report),
            AttemptOutcome::Failed(err) => Err(err),
            AttemptOutcome::AlreadyLoaded(module) => Err(InstallerError::LoadFailed {
                module,
                reason: format!(
                    "another copy of the module is loaded ({})\nkernel log:\n{}",
                    Errno::EEXIST.desc(),
                    report.kernel_log
                ),
            }),
        }
    }

    fn attempt(
        &self,
        request: &LoadTestRequest<'_>,
        pause_queue: bool,
    ) -> (AttemptOutcome, LoadTestReport) {
        let mut report = LoadTestReport::default();

        let paused = pause_queue && self.pause_queue();
        let loaded_deps = self.preload(request.preload);
        self.remove_stale(request.modules);

        let guard = LogLevelGuard::set(self.state, QUIET_CONSOLE_LEVEL);
        let mut loaded = Vec::new();
        let outcome = self.insert_all(request, &mut loaded, &mut report);
        if !loaded.is_empty() {
            report.warnings = self.state.module_warnings(request.package_name);
        }

        if paused {
            if let Err(err) = self.queue.resume() {
                log::warn!("unable to resume the device event queue: {err}");
            }
        }
        for name in loaded.iter().rev() {
            if let Err(err) = self.loader.remove(name) {
                log::warn!("unable to unload {name} after the load test: {err}");
            }
        }
        drop(guard);
        report.kernel_log = self.state.kernel_log_tail(KERNEL_LOG_LINES);

        for dep in loaded_deps.iter().rev() {
            if let Err(err) = self.deps.unload(dep) {
                log::warn!("unable to unload dependency {dep}: {err}");
            }
        }
        (outcome, report)
    }

    fn pause_queue(&self) -> bool {
        match self.queue.pause() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("unable to pause the device event queue: {err}");
                false
            }
        }
    }

    /// Load each dependency not already present, returning those loaded.
    fn preload<'p>(&self, preload: &'p [String]) -> Vec<&'p str> {
        let mut loaded = Vec::new();
        for dep in preload {
            if self.state.is_loaded(dep) {
                log::debug!("dependency {dep} is already loaded");
                continue;
            }
            match self.deps.load(dep) {
                Ok(()) => loaded.push(dep.as_str()),
                Err(err) => log::warn!("unable to load dependency {dep}: {err}"),
            }
        }
        loaded
    }

    fn remove_stale(&self, modules: &ModuleSet) {
        for spec in modules.unload_order() {
            let name = spec.name().kernel_name();
            match self.loader.remove(&name) {
                Ok(()) => log::info!("unloaded a previously loaded {name}"),
                Err(err) if err.errno == Errno::ENOENT => {}
                Err(err) => log::warn!("unable to unload {name} before the load test: {err}"),
            }
        }
    }

    fn insert_all(
        &self,
        request: &LoadTestRequest<'_>,
        loaded: &mut Vec<String>,
        report: &mut LoadTestReport,
    ) -> AttemptOutcome {
        for spec in request.modules.iter() {
            let Some(module) = request.built.iter().find(|m| &m.name == spec.name()) else {
                return AttemptOutcome::Failed(InstallerError::LoadFailed {
                    module: spec.name().clone(),
                    reason: "no module file was produced".to_owned(),
                });
            };

            let err = match self.loader.insert(&module.path, request.parameters) {
                Ok(()) => {
                    log::debug!("loaded {}", module.path);
                    loaded.push(spec.name().kernel_name());
                    continue;
                }
                Err(err) if err.errno == Errno::EEXIST => {
                    return AttemptOutcome::AlreadyLoaded(spec.name().clone());
                }
                Err(err) => err,
            };

            let kernel_log = self.state.kernel_log_tail(KERNEL_LOG_LINES);
            match classify_failure(module, &err, self.policy, self.prompter, &kernel_log) {
                FailureDecision::Ignore => {
                    // Later modules depend on this one, so they cannot load either.
                    log::info!(
                        "not loading the modules after {}; the load test is skipped",
                        spec.name()
                    );
                    report.skip_future_load_tests = true;
                    return AttemptOutcome::Passed;
                }
                FailureDecision::Fatal(failure) if spec.is_optional() => {
                    let hint = spec.disable_hint();
                    log::warn!(
                        "optional module {} failed to load: {failure}{}",
                        spec.name(),
                        hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
                    );
                    report.optional_failures.push(OptionalLoadFailure {
                        module: spec.name().clone(),
                        reason: failure.to_string(),
                        hint,
                    });
                    return AttemptOutcome::Passed;
                }
                FailureDecision::Fatal(failure) => return AttemptOutcome::Failed(failure),
            }
        }
        AttemptOutcome::Passed
    }
}

#[cfg(test)]
#[path = "tester_tests.rs"]
mod tests;
