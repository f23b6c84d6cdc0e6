//! Unit tests for the load-test state machine.

use super::*;
use crate::load_test::loader::{LoadError, MockModuleLoader};
use crate::load_test::system::{MockDependencyLoader, MockEventQueue, MockKernelState};
use crate::module_spec::KernelModuleSpec;
use crate::prompt::{Choice, MockPrompter};
use camino::Utf8PathBuf;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Calls = Arc<Mutex<Vec<String>>>;

fn record(calls: &Calls, entry: String) {
    calls.lock().expect("calls lock").push(entry);
}

fn modules() -> ModuleSet {
    ModuleSet::new(vec![
        KernelModuleSpec::new("core", "core.ko"),
        KernelModuleSpec::new("uvm", "uvm.ko").optional("CUDA", "no-unified-memory"),
    ])
}

fn built(core_signed: bool) -> Vec<BuiltModule> {
    vec![
        BuiltModule {
            name: ModuleName::from("core"),
            path: Utf8PathBuf::from("/pkg/kernel/core.ko"),
            signed: core_signed,
        },
        BuiltModule {
            name: ModuleName::from("uvm"),
            path: Utf8PathBuf::from("/pkg/kernel/uvm.ko"),
            signed: false,
        },
    ]
}

struct Harness {
    calls: Calls,
    loader: MockModuleLoader,
    state: MockKernelState,
    queue: MockEventQueue,
    deps: MockDependencyLoader,
    prompter: MockPrompter,
}

impl Harness {
    /// Script insertion results in call order; later insertions succeed.
    fn new(inserts: Vec<std::result::Result<(), LoadError>>, already_loaded: &[&str]) -> Self {
        let calls: Calls = Arc::default();

        let mut loader = MockModuleLoader::new();
        let mut inserts: VecDeque<_> = inserts.into();
        let log = Arc::clone(&calls);
        loader.expect_insert().returning(move |path, _| {
            record(&log, format!("insert {}", path.file_name().unwrap_or_default()));
            inserts.pop_front().unwrap_or(Ok(()))
        });
        let log = Arc::clone(&calls);
        loader.expect_remove().returning(move |name| {
            record(&log, format!("remove {name}"));
            Ok(())
        });

        let mut state = MockKernelState::new();
        let present: Vec<String> = already_loaded.iter().map(|s| (*s).to_owned()).collect();
        state
            .expect_is_loaded()
            .returning(move |module| present.iter().any(|p| p == module));
        state
            .expect_console_log_level()
            .return_const(Some("4".to_owned()));
        let log = Arc::clone(&calls);
        state.expect_set_console_log_level().returning(move |level| {
            record(&log, format!("level {level}"));
            Ok(())
        });
        state.expect_module_warnings().returning(|_| {
            vec![ModuleWarning {
                name: "fbdev".to_owned(),
                text: "framebuffer console disabled".to_owned(),
            }]
        });
        state
            .expect_kernel_log_tail()
            .returning(|_| "core: loading out-of-tree module taints kernel.".to_owned());

        let mut queue = MockEventQueue::new();
        let log = Arc::clone(&calls);
        queue.expect_pause().returning(move || {
            record(&log, "pause".to_owned());
            Ok(())
        });
        let log = Arc::clone(&calls);
        queue.expect_resume().returning(move || {
            record(&log, "resume".to_owned());
            Ok(())
        });

        let mut deps = MockDependencyLoader::new();
        let log = Arc::clone(&calls);
        deps.expect_load().returning(move |module| {
            record(&log, format!("load {module}"));
            Ok(())
        });
        let log = Arc::clone(&calls);
        deps.expect_unload().returning(move |module| {
            record(&log, format!("unload {module}"));
            Ok(())
        });

        Self {
            calls,
            loader,
            state,
            queue,
            deps,
            prompter: MockPrompter::new(),
        }
    }

    fn run(&self, built: &[BuiltModule], preload: &[String]) -> Result<LoadTestReport> {
        let modules = modules();
        let request = LoadTestRequest {
            package_name: "acme",
            modules: &modules,
            built,
            preload,
            parameters: "modeset=1",
        };
        LoadTester::new(
            &self.loader,
            &self.state,
            &self.queue,
            &self.deps,
            &self.prompter,
        )
        .test_load(&request)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

fn failure(errno: Errno) -> std::result::Result<(), LoadError> {
    Err(LoadError::new(errno, "unable to insert module"))
}

#[test]
fn loads_and_unloads_in_order_and_keeps_present_dependencies() {
    let harness = Harness::new(Vec::new(), &["drm"]);
    let preload = vec!["drm".to_owned(), "i2c-core".to_owned()];

    let report = harness.run(&built(false), &preload).expect("load test passes");

    assert_eq!(
        harness.calls(),
        [
            "load i2c-core",
            "remove uvm",
            "remove core",
            "level 1",
            "insert core.ko",
            "insert uvm.ko",
            "remove uvm",
            "remove core",
            "level 4",
            "unload i2c-core",
        ]
    );
    assert!(!report.retried);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.kernel_log.contains("taints kernel"));
}

#[test]
fn already_loaded_retries_once_with_queue_paused() {
    let harness = Harness::new(vec![failure(Errno::EEXIST)], &[]);

    let report = harness.run(&built(false), &[]).expect("retry passes");

    assert!(report.retried);
    assert_eq!(
        harness.calls(),
        [
            "remove uvm",
            "remove core",
            "level 1",
            "insert core.ko",
            "level 4",
            "pause",
            "remove uvm",
            "remove core",
            "level 1",
            "insert core.ko",
            "insert uvm.ko",
            "resume",
            "remove uvm",
            "remove core",
            "level 4",
        ]
    );
}

#[test]
fn repeated_already_loaded_fails_after_one_retry() {
    let harness = Harness::new(vec![failure(Errno::EEXIST), failure(Errno::EEXIST)], &[]);

    let err = harness.run(&built(false), &[]).expect_err("still raced");

    assert!(
        matches!(err, InstallerError::LoadFailed { ref module, .. } if module.as_str() == "core"),
        "unexpected error: {err}"
    );
    assert_eq!(harness.calls().iter().filter(|c| *c == "pause").count(), 1);
}

#[test]
fn other_failures_are_not_retried() {
    let harness = Harness::new(vec![failure(Errno::ENOENT)], &[]);

    let err = harness.run(&built(false), &[]).expect_err("load fails");

    assert!(
        matches!(err, InstallerError::LoadFailed { ref reason, .. } if reason.contains("taints kernel")),
        "unexpected error: {err}"
    );
    let calls = harness.calls();
    assert!(!calls.iter().any(|c| c == "pause"));
    assert_eq!(calls.last().map(String::as_str), Some("level 4"));
}

#[test]
fn signed_module_rejected_for_missing_key_can_be_installed_anyway() {
    let mut harness = Harness::new(vec![failure(Errno::ENOKEY)], &[]);
    harness
        .prompter
        .expect_choose()
        .times(1)
        .return_const(Choice::Proceed);

    let report = harness.run(&built(true), &[]).expect("operator accepts");

    assert!(report.skip_future_load_tests);
    assert_eq!(
        harness.calls(),
        ["remove uvm", "remove core", "level 1", "insert core.ko", "level 4"],
        "modules after an accepted signature failure are not inserted"
    );
}

#[test]
fn accepted_signature_failure_unloads_modules_already_inserted() {
    let mut harness = Harness::new(vec![Ok(()), failure(Errno::ENOKEY)], &[]);
    harness
        .prompter
        .expect_choose()
        .times(1)
        .return_const(Choice::Proceed);
    let mut built = built(false);
    if let Some(uvm) = built.last_mut() {
        uvm.signed = true;
    }

    let report = harness.run(&built, &[]).expect("operator accepts");

    assert!(report.skip_future_load_tests);
    assert!(report.optional_failures.is_empty());
    assert_eq!(
        harness.calls(),
        [
            "remove uvm",
            "remove core",
            "level 1",
            "insert core.ko",
            "insert uvm.ko",
            "remove core",
            "level 4",
        ]
    );
}

#[test]
fn optional_module_failure_is_reported_without_failing() {
    let harness = Harness::new(vec![Ok(()), failure(Errno::ENOEXEC)], &[]);

    let report = harness.run(&built(false), &[]).expect("optional failure tolerated");

    assert_eq!(report.optional_failures.len(), 1);
    let failure = report
        .optional_failures
        .first()
        .expect("one optional failure");
    assert_eq!(failure.module.as_str(), "uvm");
    assert!(
        failure
            .hint
            .as_deref()
            .is_some_and(|hint| hint.contains("--disable-module no-unified-memory"))
    );
    assert_eq!(
        harness.calls().iter().filter(|c| *c == "remove uvm").count(),
        1
    );
}
