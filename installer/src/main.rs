//! kmodsmith installer CLI entrypoint.
//!
//! This binary wires the host system (commands, kernel pseudo files, the
//! terminal) into the installer core and reports the outcome on stderr.

use clap::Parser;
use kmodsmith_installer::artefact::extraction::ZstdExtractor;
use kmodsmith_installer::cli::Cli;
use kmodsmith_installer::command::SystemCommandExecutor;
use kmodsmith_installer::config::Environment;
use kmodsmith_installer::error::{InstallerError, Result};
use kmodsmith_installer::install_flow::{
    InstallContext, InstallSummary, LoadTestSystem, run_install,
};
use kmodsmith_installer::kernel::{KernelContext, SystemRoot};
use kmodsmith_installer::load_test::{
    ModprobeDependencies, SystemKernelState, UdevEventQueue, select_loader,
};
use kmodsmith_installer::output::{
    Reporter, packaged_message, success_message, write_stderr_line,
};
use kmodsmith_installer::prompt::{NonInteractivePrompter, Prompter, TerminalPrompter};
use log::{LevelFilter, Metadata, Record};
use std::io::Write;

/// Writes log records to stderr.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut stderr = std::io::stderr().lock();
            write_stderr_line(
                &mut stderr,
                format_args!("[{}] {}", record.level(), record.args()),
            );
        }
    }

    fn flush(&self) {}
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity, cli.quiet);
    let mut stderr = std::io::stderr();
    let run_result = run(&cli, &mut stderr);
    let exit_code = exit_code_for_run_result(run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn level_for(verbosity: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbosity) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Warn,
        (false, 1) => LevelFilter::Info,
        (false, 2) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

fn init_logging(verbosity: u8, quiet: bool) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_for(verbosity, quiet));
    }
}

fn run(cli: &Cli, stderr: &mut dyn Write) -> Result<()> {
    let options = cli.install_options();
    let root = SystemRoot::default();
    let env = Environment::from_process();
    let kernel = KernelContext::detect(&root, options.kernel_name.as_deref())?;
    let executor = SystemCommandExecutor;

    let terminal;
    let prompter: &dyn Prompter = if options.no_questions {
        &NonInteractivePrompter
    } else {
        terminal = TerminalPrompter::new(std::io::stdin().lock(), std::io::stderr());
        &terminal
    };

    let loader = select_loader(&root, &executor);
    let state = SystemKernelState::new(root.clone(), &executor);
    let queue = UdevEventQueue::new(&executor);
    let deps = ModprobeDependencies::new(&executor);
    let context = InstallContext {
        root: &root,
        kernel: &kernel,
        env: &env,
        executor: &executor,
        prompter,
        extractor: &ZstdExtractor,
        load_test: LoadTestSystem {
            loader: loader.as_ref(),
            state: &state,
            queue: &queue,
            deps: &deps,
        },
    };

    let mut reporter = Reporter::new(stderr, options.quiet);
    match run_install(&options, &context, &mut reporter)? {
        InstallSummary::Installed {
            destination,
            modules,
            ..
        } => reporter.always(success_message(modules.len(), &destination)),
        InstallSummary::Packaged { archive, artefacts } => {
            reporter.always(packaged_message(artefacts, &archive));
        }
    }
    Ok(())
}

fn exit_code_for_run_result(result: Result<()>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            write_stderr_line(stderr, format_args!("error: {err}"));
            if let Some(hint) = err.recovery_hint() {
                write_stderr_line(stderr, format_args!("hint: {hint}"));
            }
            match err {
                InstallerError::Aborted { .. } => 2,
                _ => 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmodsmith_installer::module_spec::ModuleName;
    use rstest::rstest;

    #[test]
    fn exit_code_for_run_result_returns_zero_on_success() {
        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Ok(()), &mut stderr);
        assert_eq!(exit_code, 0);
        assert!(stderr.is_empty());
    }

    #[test]
    fn exit_code_for_run_result_prints_error_and_hint() {
        let err = InstallerError::SignatureRequired {
            module: ModuleName::from("acme"),
        };

        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Err(err), &mut stderr);
        assert_eq!(exit_code, 1);

        let stderr_text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(stderr_text.contains("error: kernel module acme failed to load"));
        assert!(stderr_text.contains("hint: sign the module"));
    }

    #[test]
    fn operator_abort_has_its_own_exit_code() {
        let err = InstallerError::Aborted {
            reason: "configuration conflict".to_owned(),
        };
        let mut stderr = Vec::new();
        assert_eq!(exit_code_for_run_result(Err(err), &mut stderr), 2);
    }

    #[rstest]
    #[case::default(0, false, LevelFilter::Warn)]
    #[case::verbose(1, false, LevelFilter::Info)]
    #[case::very_verbose(2, false, LevelFilter::Debug)]
    #[case::trace(5, false, LevelFilter::Trace)]
    #[case::quiet(0, true, LevelFilter::Error)]
    fn verbosity_selects_log_level(
        #[case] verbosity: u8,
        #[case] quiet: bool,
        #[case] expected: LevelFilter,
    ) {
        assert_eq!(level_for(verbosity, quiet), expected);
    }
}
