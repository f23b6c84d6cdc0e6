//! Operator-facing output.
//!
//! Diagnostics go through the `log` facade; the lines an operator is meant
//! to read (stage banners, build progress, the final summary) are written to
//! an injected stream through [`Reporter`], which honours quiet mode.

use crate::toolchain::progress::ProgressSink;
use camino::Utf8Path;
use std::io::Write;

/// Progress is reported in steps of this many percent.
const PROGRESS_STEP: u8 = 10;

/// Write one line to `stderr`, ignoring write failures.
pub fn write_stderr_line(stderr: &mut dyn Write, message: impl std::fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort output; ignore write failures.
    }
}

/// Writes operator-facing lines unless quiet mode is enabled.
pub struct Reporter<'w> {
    out: &'w mut dyn Write,
    quiet: bool,
    last_progress: Option<u8>,
}

impl<'w> Reporter<'w> {
    /// Create a reporter writing to `out`.
    pub fn new(out: &'w mut dyn Write, quiet: bool) -> Self {
        Self {
            out,
            quiet,
            last_progress: None,
        }
    }

    /// Write one line.
    pub fn line(&mut self, message: impl std::fmt::Display) {
        if !self.quiet {
            write_stderr_line(self.out, message);
        }
    }

    /// Write a line even in quiet mode; used for failures and the build log.
    pub fn always(&mut self, message: impl std::fmt::Display) {
        write_stderr_line(self.out, message);
    }

    /// Return true when ordinary lines are suppressed.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

impl ProgressSink for Reporter<'_> {
    fn update(&mut self, label: &str, percent: u8) {
        let step = percent - percent % PROGRESS_STEP;
        let due = match self.last_progress {
            // A new build restarts at zero.
            Some(last) if percent == 0 || step > last || (percent == 100 && last < 100) => true,
            Some(_) => false,
            None => true,
        };
        if !due {
            return;
        }
        self.last_progress = Some(if percent == 100 { 100 } else { step });
        self.line(format_args!("{label}: {percent}%"));
    }
}

/// Summary line after modules were installed.
#[must_use]
pub fn success_message(count: usize, destination: &Utf8Path) -> String {
    let plural = if count == 1 { "module" } else { "modules" };
    format!("Installed {count} kernel {plural} into {destination}")
}

/// Summary line after a precompiled bundle was written.
#[must_use]
pub fn packaged_message(count: usize, archive: &Utf8Path) -> String {
    let plural = if count == 1 { "artefact" } else { "artefacts" };
    format!("Packaged {count} precompiled {plural} into {archive}")
}
