//! Shared test utilities for the installer crate.
//!
//! Helpers here fail loudly on fixture setup errors.

#![allow(
    clippy::expect_used,
    clippy::panic,
    clippy::missing_panics_doc,
    reason = "test fixtures abort the test on setup failure"
)]

use crate::command::{CommandExecutor, CommandOutcome, Invocation};
use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;

/// Side effect applied when a scripted command runs, e.g. creating the
/// module file a build would have produced.
pub type Effect = Box<dyn FnOnce(&Invocation)>;

/// Represents an expected command invocation for testing.
pub struct ExpectedCall {
    /// The program expected to run (e.g., "make"); an absolute program path
    /// matches by its file name.
    pub program: &'static str,
    /// Fragments that must each appear in the rendered command line.
    pub fragments: Vec<String>,
    /// The result to return when this command is invoked.
    pub result: Result<CommandOutcome>,
    /// Optional side effect run before the result is returned.
    pub effect: Option<Effect>,
}

impl ExpectedCall {
    /// Expect `program` with the given command line fragments; succeeds with
    /// no output unless configured otherwise.
    pub fn new<I, S>(program: &'static str, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            fragments: fragments.into_iter().map(Into::into).collect(),
            result: Ok(CommandOutcome::new(0, "")),
            effect: None,
        }
    }

    /// Succeed and print `output`.
    #[must_use]
    pub fn output(mut self, output: &str) -> Self {
        self.result = Ok(CommandOutcome::new(0, output));
        self
    }

    /// Exit with `status` and print `output`.
    #[must_use]
    pub fn fails(mut self, status: i32, output: &str) -> Self {
        self.result = Ok(CommandOutcome::new(status, output));
        self
    }

    /// Return `error` instead of running.
    #[must_use]
    pub fn errors(mut self, error: crate::error::InstallerError) -> Self {
        self.result = Err(error);
        self
    }

    /// Run `effect` when the command is invoked.
    #[must_use]
    pub fn then(mut self, effect: impl FnOnce(&Invocation) + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    /// Create `path` with `contents` when the command is invoked.
    #[must_use]
    pub fn creates(self, path: impl Into<Utf8PathBuf>, contents: &'static [u8]) -> Self {
        let path = path.into();
        self.then(move |_| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("create parent directory");
            }
            std::fs::write(&path, contents).expect("write scripted file");
        })
    }
}

impl fmt::Debug for ExpectedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedCall")
            .field("program", &self.program)
            .field("fragments", &self.fragments)
            .field("result", &self.result)
            .field("effect", &self.effect.is_some())
            .finish()
    }
}

/// A stub implementation of `CommandExecutor` for testing.
///
/// Replays expected command invocations in order and returns predefined
/// results, allowing tests to verify command execution without side effects.
#[derive(Debug, Default)]
pub struct StubExecutor {
    expected: RefCell<VecDeque<ExpectedCall>>,
    seen: RefCell<Vec<Invocation>>,
}

impl StubExecutor {
    /// Creates a new `StubExecutor` with the given expected calls.
    pub fn new(expected: Vec<ExpectedCall>) -> Self {
        Self {
            expected: RefCell::new(expected.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    /// Return the invocations received so far.
    pub fn seen(&self) -> Vec<Invocation> {
        self.seen.borrow().clone()
    }

    /// Asserts that all expected command invocations have been consumed.
    ///
    /// # Panics
    ///
    /// Panics if there are remaining expected calls that were not invoked.
    pub fn assert_finished(&self) {
        let remaining = self.expected.borrow();
        assert!(
            remaining.is_empty(),
            "expected no further command invocations, {} remain: {:?}",
            remaining.len(),
            remaining.front()
        );
    }
}

impl CommandExecutor for StubExecutor {
    fn run(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutcome> {
        self.seen.borrow_mut().push(invocation.clone());
        let call = self
            .expected
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected command invocation: {}", invocation.command_line()));

        let line = invocation.command_line();
        let program = invocation.program();
        assert!(
            program == call.program || program.ends_with(&format!("/{}", call.program)),
            "expected program `{}` in `{line}`",
            call.program
        );
        for fragment in &call.fragments {
            assert!(
                line.contains(fragment.as_str()),
                "expected `{fragment}` in `{line}`"
            );
        }

        if let Some(effect) = call.effect {
            effect(invocation);
        }
        if let Ok(outcome) = &call.result {
            for output_line in outcome.output.lines() {
                on_line(output_line);
            }
        }
        call.result
    }
}

/// Create a UTF-8 temporary directory.
pub fn utf8_temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().expect("create temp dir");
    let path = Utf8PathBuf::try_from(temp.path().to_path_buf()).expect("UTF-8 temp path");
    (temp, path)
}

/// Write `contents` to `root/relative`, creating parent directories.
pub fn write_file(root: &Utf8Path, relative: &str, contents: impl AsRef<[u8]>) -> Utf8PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directory");
    }
    std::fs::write(&path, contents).expect("write test file");
    path
}

/// Write a bundle holding `artefacts` to `dir/file_name`.
///
/// Each payload contains its own name, so digests differ per artefact.
pub fn write_bundle(
    dir: &Utf8Path,
    file_name: &str,
    proc_version: &str,
    driver_version: &str,
    artefacts: Vec<crate::artefact::precompiled::PrecompiledArtefact>,
) -> Utf8PathBuf {
    use crate::artefact::packaging::{BundleParams, PackagedFile, package_bundle};

    let scratch = tempfile::tempdir().expect("scratch dir");
    let scratch_path = Utf8PathBuf::try_from(scratch.path().to_path_buf()).expect("UTF-8 path");
    let artefacts = artefacts
        .into_iter()
        .map(|artefact| PackagedFile {
            payload_path: write_file(&scratch_path, artefact.payload(), artefact.payload()),
            artefact,
        })
        .collect();
    let archive_path = dir.join(file_name);
    package_bundle(&BundleParams {
        description: format!("{proc_version} test bundle"),
        proc_version: proc_version.to_owned(),
        driver_version: driver_version.to_owned(),
        artefacts,
        archive_path: archive_path.clone(),
    })
    .expect("package bundle");
    archive_path
}
