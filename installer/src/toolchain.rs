//! Kernel build toolchain invocation.
//!
//! [`ToolchainRunner`] wraps the external programs that test and build the
//! kernel modules: the `conftest.sh` feature-test driver shipped in each
//! module type directory, and `make` against the kernel build system. Every
//! invocation's output is appended to a [`BuildLog`] that is kept even when
//! the command succeeds.

pub mod progress;

use crate::command::{CommandExecutor, CommandOutcome, Invocation};
use crate::error::Result;
use crate::module_spec::ModuleName;
use crate::paths::KernelPaths;
use camino::Utf8Path;
use progress::{BuildCounts, ProgressPlan, ProgressSink, ProgressTracker, parse_counts};

/// Name of the feature-test driver script in each build directory.
pub const FEATURE_TEST_SCRIPT: &str = "conftest.sh";

/// Make target that reports expected build counts.
const COUNT_TARGET: &str = "count-build-steps";

/// Settings shared by every toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSettings {
    /// Compiler passed as `CC`.
    pub compiler: String,
    /// Kbuild architecture passed as `ARCH`.
    pub arch: String,
    /// The `make` program.
    pub make: String,
    /// Parallel jobs passed to `make`.
    pub jobs: usize,
    /// Export `IGNORE_CC_MISMATCH=1` to feature tests and builds.
    pub ignore_cc_mismatch: bool,
}

/// Result of one feature test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTestResult {
    /// True when the script exited successfully.
    pub passed: bool,
    /// The script's own output, trimmed.
    pub message: String,
}

/// Accumulated output of every toolchain invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildLog {
    text: String,
}

impl BuildLog {
    /// Record one command and its output.
    pub fn record(&mut self, command_line: &str, outcome: &CommandOutcome) {
        self.text.push_str("$ ");
        self.text.push_str(command_line);
        self.text.push('\n');
        self.text.push_str(&outcome.output);
        if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
            self.text.push('\n');
        }
        if !outcome.success() {
            self.text
                .push_str(&format!("[exit status {}]\n", outcome.status));
        }
    }

    /// Return the full log text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Return true when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Progress reporting attached to a build.
pub struct BuildProgress<'p> {
    /// Label shown next to the percentage.
    pub label: &'p str,
    /// Expected stages of the build output.
    pub plan: &'p ProgressPlan,
    /// Destination of progress updates.
    pub sink: &'p mut dyn ProgressSink,
}

/// Runs feature tests and builds against one resolved kernel.
pub struct ToolchainRunner<'a> {
    executor: &'a dyn CommandExecutor,
    settings: ToolchainSettings,
    paths: KernelPaths,
    log: BuildLog,
}

impl<'a> ToolchainRunner<'a> {
    /// Create a runner for the kernel at `paths`.
    #[must_use]
    pub fn new(
        executor: &'a dyn CommandExecutor,
        settings: ToolchainSettings,
        paths: KernelPaths,
    ) -> Self {
        Self {
            executor,
            settings,
            paths,
            log: BuildLog::default(),
        }
    }

    /// Return the resolved kernel paths.
    #[must_use]
    pub fn paths(&self) -> &KernelPaths {
        &self.paths
    }

    /// Return the toolchain settings.
    #[must_use]
    pub fn settings(&self) -> &ToolchainSettings {
        &self.settings
    }

    /// Return the accumulated build log.
    #[must_use]
    pub fn log(&self) -> &BuildLog {
        &self.log
    }

    /// Return the executor used for every invocation.
    #[must_use]
    pub fn executor(&self) -> &'a dyn CommandExecutor {
        self.executor
    }

    /// Run an arbitrary command and record its output in the build log.
    ///
    /// # Errors
    ///
    /// Propagates spawn failures.
    pub fn run(&mut self, invocation: &Invocation) -> Result<CommandOutcome> {
        let outcome = self.executor.run(invocation, &mut |_| {})?;
        self.log.record(&invocation.command_line(), &outcome);
        Ok(outcome)
    }

    /// Run the feature test `test` from `dir`'s driver script.
    ///
    /// # Errors
    ///
    /// Propagates spawn failures; a failing test is reported through the
    /// result rather than as an error.
    pub fn run_feature_test(
        &mut self,
        dir: &Utf8Path,
        test: &str,
        extra: &[&str],
    ) -> Result<FeatureTestResult> {
        let invocation = self.with_cc_policy(
            Invocation::new("sh")
                .arg(dir.join(FEATURE_TEST_SCRIPT).as_str())
                .arg(self.settings.compiler.as_str())
                .arg(self.settings.arch.as_str())
                .arg(self.paths.source.as_str())
                .arg(self.paths.output.as_str())
                .arg(test)
                .arg("full_output")
                .args(extra.iter().copied())
                .current_dir(dir),
        );
        let outcome = self.run(&invocation)?;
        log::debug!("feature test {test}: status {}", outcome.status);
        Ok(FeatureTestResult {
            passed: outcome.success(),
            message: outcome.output.trim().to_owned(),
        })
    }

    /// Run `make <target>` in `dir`.
    ///
    /// The kernel paths, compiler, architecture, job count and the module
    /// exclusion list are always passed; `vars` adds target-specific
    /// variables.
    ///
    /// # Errors
    ///
    /// Propagates spawn failures; a failing build is reported through the
    /// outcome.
    pub fn run_build(
        &mut self,
        dir: &Utf8Path,
        target: &str,
        excluded: &[ModuleName],
        vars: &[String],
        progress: Option<BuildProgress<'_>>,
    ) -> Result<CommandOutcome> {
        let invocation = self.make_invocation(dir, target, excluded, vars);
        let outcome = match progress {
            Some(progress) => {
                let mut tracker = ProgressTracker::new(progress.plan);
                let sink = progress.sink;
                let label = progress.label;
                sink.update(label, 0);
                let outcome = self.executor.run(&invocation, &mut |line| {
                    if let Some(percent) = tracker.observe(line) {
                        sink.update(label, percent);
                    }
                })?;
                if outcome.success() {
                    sink.update(label, tracker.finish());
                }
                outcome
            }
            None => self.executor.run(&invocation, &mut |_| {})?,
        };
        self.log.record(&invocation.command_line(), &outcome);
        Ok(outcome)
    }

    /// Ask the makefile how many build steps to expect.
    ///
    /// Falls back to [`BuildCounts::default`] when the counting pass fails;
    /// the estimate never aborts a build.
    pub fn count_build_steps(&mut self, dir: &Utf8Path, excluded: &[ModuleName]) -> ProgressPlan {
        let counts = match self.run_build(dir, COUNT_TARGET, excluded, &[], None) {
            Ok(outcome) if outcome.success() => parse_counts(&outcome.output).unwrap_or_else(|| {
                log::debug!("unrecognised build step counts; using defaults");
                BuildCounts::default()
            }),
            Ok(outcome) => {
                log::debug!("build step counting failed: {}", outcome.message());
                BuildCounts::default()
            }
            Err(err) => {
                log::debug!("build step counting failed: {err}");
                BuildCounts::default()
            }
        };
        ProgressPlan::from_counts(counts)
    }

    fn make_invocation(
        &self,
        dir: &Utf8Path,
        target: &str,
        excluded: &[ModuleName],
        vars: &[String],
    ) -> Invocation {
        let exclusions = excluded
            .iter()
            .map(ModuleName::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        self.with_cc_policy(
            Invocation::new(self.settings.make.as_str())
                .arg("-C")
                .arg(dir.as_str())
                .arg(target)
                .arg(format!("-j{}", self.settings.jobs.max(1)))
                .arg(format!("SYSSRC={}", self.paths.source))
                .arg(format!("SYSOUT={}", self.paths.output))
                .arg(format!("CC={}", self.settings.compiler))
                .arg(format!("ARCH={}", self.settings.arch))
                .arg(format!("EXCLUDE_KERNEL_MODULES={exclusions}"))
                .args(vars.iter().cloned()),
        )
    }

    fn with_cc_policy(&self, invocation: Invocation) -> Invocation {
        if self.settings.ignore_cc_mismatch {
            invocation.env("IGNORE_CC_MISMATCH", "1")
        } else {
            invocation
        }
    }
}
