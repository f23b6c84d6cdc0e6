//! External command execution.
//!
//! Every external tool (compiler checks, `make`, the linker, the signer,
//! `modprobe`, `udevadm`, `dmesg`) is invoked through the [`CommandExecutor`]
//! trait: an [`Invocation`] goes in, an exit status and the captured output
//! come out. Output lines are also streamed to a callback so callers can
//! drive progress reporting while the command runs.

use crate::error::{InstallerError, Result};
use camino::Utf8PathBuf;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};

/// A single external command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<Utf8PathBuf>,
}

impl Invocation {
    /// Start an invocation of `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the command.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run the command in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Return the program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Return the arguments.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Return the extra environment.
    #[must_use]
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Render the invocation for logs and error messages.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        for (key, value) in &self.env {
            line.push_str(&format!("{key}={value} "));
        }
        line.push_str(&self.program);
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push_str(&format!("\"{arg}\""));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Exit status and combined output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit status; `128 + signal` when the command was killed by a signal.
    pub status: i32,
    /// Captured standard output followed by standard error.
    pub output: String,
}

impl CommandOutcome {
    /// Create an outcome from a status and output text.
    #[must_use]
    pub fn new(status: i32, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    /// Return true when the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Return the trimmed output, or a placeholder when there was none.
    #[must_use]
    pub fn message(&self) -> String {
        let trimmed = self.output.trim();
        if trimmed.is_empty() {
            "no output".to_owned()
        } else {
            trimmed.to_owned()
        }
    }
}

/// Abstraction for running external commands.
pub trait CommandExecutor {
    /// Runs the invocation, streaming each output line to `on_line`.
    ///
    /// # Errors
    ///
    /// Returns an error when the program cannot be spawned. A program that
    /// runs and exits unsuccessfully is reported through the outcome.
    fn run(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str))
    -> Result<CommandOutcome>;
}

/// Run an invocation without observing its output lines.
///
/// # Errors
///
/// Propagates spawn failures from the executor.
pub fn run_captured(
    executor: &dyn CommandExecutor,
    invocation: &Invocation,
) -> Result<CommandOutcome> {
    executor.run(invocation, &mut |_| {})
}

/// Executes commands on the host system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn run(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutcome> {
        log::debug!("running: {}", invocation.command_line());

        let mut cmd = Command::new(invocation.program());
        cmd.args(invocation.arguments())
            .envs(invocation.environment().iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                InstallerError::ToolNotFound {
                    tool: invocation.program().to_owned(),
                    reason: e.to_string(),
                }
            }
            _ => InstallerError::Io(e),
        })?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let mut bytes = Vec::new();
                if stderr.read_to_end(&mut bytes).is_ok() {
                    text = String::from_utf8_lossy(&bytes).into_owned();
                }
                text
            })
        });

        let mut output = String::new();
        let streamed = match child.stdout.take() {
            Some(stdout) => stream_lines(stdout, on_line, &mut output),
            None => Ok(()),
        };
        if let Err(err) = streamed {
            log::warn!("lost the output of {}: {err}", invocation.program());
            terminate(&mut child);
            return Err(err.into());
        }

        let status = child.wait()?;
        if let Some(handle) = stderr_reader {
            let stderr_text = handle.join().unwrap_or_default();
            for line in stderr_text.lines() {
                on_line(line);
            }
            output.push_str(&stderr_text);
        }

        Ok(CommandOutcome {
            status: exit_code(status),
            output,
        })
    }
}

/// Pass each line of `reader` to `on_line` and append it to `output`.
fn stream_lines(
    reader: impl Read,
    on_line: &mut dyn FnMut(&str),
    output: &mut String,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&raw);
        on_line(line.trim_end_matches('\n'));
        output.push_str(&line);
    }
}

/// Kill `child` and wait for it so no zombie is left behind.
fn terminate(child: &mut Child) {
    if let Err(err) = child.kill() {
        log::debug!("unable to kill process {}: {err}", child.id());
    }
    if let Err(err) = child.wait() {
        log::warn!("unable to wait for process {}: {err}", child.id());
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}
