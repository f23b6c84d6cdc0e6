//! CLI argument definitions for the kmodsmith installer.
//!
//! This module defines the command-line interface using clap and converts
//! the parsed arguments into the [`InstallOptions`] consumed by the
//! installer core.

use crate::config::{InstallOptions, ModuleTypeOverride, SigningOptions};
use camino::Utf8PathBuf;
use clap::Parser;

/// Build, sign, and load-test the kernel modules of a driver package.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "kmodsmith-installer")]
#[command(version, about)]
#[command(long_about = concat!(
    "Build, sign, and load-test the kernel modules of a driver package.\n\n",
    "The installer looks for a precompiled bundle matching the running kernel ",
    "first and builds the modules from source when none matches. The modules ",
    "are then inserted into the running kernel and removed again to prove that ",
    "they load.",
))]
#[command(after_help = concat!(
    "ENVIRONMENT:\n",
    "  SYSSRC   Kernel source path (overridden by --kernel-source-path)\n",
    "  SYSOUT   Kernel output path (overridden by --kernel-output-path)\n",
    "  CC       Compiler used for feature tests and the build\n\n",
    "EXAMPLES:\n",
    "  Install the package in the current directory:\n",
    "    $ kmodsmith-installer\n\n",
    "  Build for another kernel without prompting:\n",
    "    $ kmodsmith-installer -k 6.9.0-rc1 --no-questions\n\n",
    "  Sign the modules:\n",
    "    $ kmodsmith-installer --module-signing-secret-key mok.priv \\\n",
    "        --module-signing-public-key mok.der\n\n",
    "  Write a precompiled bundle instead of installing:\n",
    "    $ kmodsmith-installer --package-precompiled /tmp/bundles",
))]
pub struct Cli {
    /// Package directory holding kmodsmith.toml [default: current directory].
    #[arg(long, value_name = "DIR")]
    pub package_dir: Option<Utf8PathBuf>,

    /// Build for this kernel release instead of the running kernel.
    #[arg(short = 'k', long, value_name = "RELEASE")]
    pub kernel_name: Option<String>,

    /// Kernel source tree.
    #[arg(long, value_name = "DIR")]
    pub kernel_source_path: Option<Utf8PathBuf>,

    /// Kernel build output tree.
    #[arg(long, value_name = "DIR")]
    pub kernel_output_path: Option<Utf8PathBuf>,

    /// Deprecated: kernel include directory; its parent is the source tree.
    #[arg(long, value_name = "DIR", hide = true)]
    pub kernel_include_path: Option<Utf8PathBuf>,

    /// Private key used to sign the modules.
    #[arg(long, value_name = "FILE")]
    pub module_signing_secret_key: Option<Utf8PathBuf>,

    /// Public key matching the signing key.
    #[arg(long, value_name = "FILE")]
    pub module_signing_public_key: Option<Utf8PathBuf>,

    /// Hash algorithm used for signing [default: detected from the kernel].
    #[arg(long, value_name = "HASH")]
    pub module_signing_hash: Option<String>,

    /// The kernel's sign-file helper [default: searched in the kernel tree].
    #[arg(long, value_name = "FILE")]
    pub module_signing_script: Option<Utf8PathBuf>,

    /// Number of parallel build jobs [default: available CPUs].
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency_level: Option<usize>,

    /// Enable expert-mode questions.
    #[arg(long)]
    pub expert: bool,

    /// Kernel module type to install, by directory name or type letter.
    #[arg(short = 'M', long, value_name = "TYPE")]
    pub kernel_module_type: Option<String>,

    /// Leave out an optional module, by name or disable flag (repeatable).
    #[arg(long = "disable-module", value_name = "NAME")]
    pub disabled_modules: Vec<String>,

    /// Do not search for precompiled bundles.
    #[arg(long)]
    pub no_precompiled: bool,

    /// Search this directory or bundle before the standard locations.
    #[arg(long, value_name = "PATH")]
    pub precompiled_path: Option<Utf8PathBuf>,

    /// Write a precompiled bundle into DIR instead of installing.
    #[arg(long, value_name = "DIR", conflicts_with = "precompiled_path")]
    pub package_precompiled: Option<Utf8PathBuf>,

    /// Accept a compiler other than the one the kernel was built with.
    #[arg(long)]
    pub ignore_cc_mismatch: bool,

    /// Do not load-test the modules.
    #[arg(long)]
    pub skip_load_test: bool,

    /// Take the default answer to every question.
    #[arg(short = 'n', long)]
    pub no_questions: bool,

    /// Lock file guarding against concurrent runs.
    #[arg(long, value_name = "FILE")]
    pub lock_file: Option<Utf8PathBuf>,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(
        short,
        long = "verbose",
        action = clap::ArgAction::Count,
        conflicts_with = "quiet"
    )]
    pub verbosity: u8,

    /// Suppress progress output (errors still shown).
    #[arg(short, long, conflicts_with = "verbosity")]
    pub quiet: bool,
}

impl Cli {
    /// Convert the arguments into installer options.
    ///
    /// # Examples
    ///
    /// ```
    /// use clap::Parser;
    /// use kmodsmith_installer::cli::Cli;
    /// use kmodsmith_installer::config::ModuleTypeOverride;
    ///
    /// let cli = Cli::parse_from(["kmodsmith-installer", "-M", "kernel-open"]);
    /// let options = cli.install_options();
    /// assert_eq!(
    ///     options.module_type,
    ///     Some(ModuleTypeOverride::Directory("kernel-open".to_owned()))
    /// );
    /// ```
    #[must_use]
    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            package_dir: self
                .package_dir
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from(".")),
            kernel_name: self.kernel_name.clone(),
            kernel_source_path: self.kernel_source_path.clone(),
            kernel_output_path: self.kernel_output_path.clone(),
            kernel_include_path: self.kernel_include_path.clone(),
            signing: SigningOptions {
                secret_key: self.module_signing_secret_key.clone(),
                public_key: self.module_signing_public_key.clone(),
                hash: self.module_signing_hash.clone(),
                sign_file: self.module_signing_script.clone(),
            },
            concurrency: self.concurrency_level.unwrap_or_else(default_concurrency),
            expert: self.expert,
            module_type: self.kernel_module_type.as_deref().map(module_type_override),
            disabled_modules: self.disabled_modules.clone(),
            skip_precompiled: self.no_precompiled,
            precompiled_path: self.precompiled_path.clone(),
            package_precompiled: self.package_precompiled.clone(),
            ignore_cc_mismatch: self.ignore_cc_mismatch,
            skip_load_test: self.skip_load_test,
            no_questions: self.no_questions,
            quiet: self.quiet,
            lock_path: self.lock_file.clone(),
        }
    }
}

/// A single character selects a type by letter, anything longer by directory.
fn module_type_override(value: &str) -> ModuleTypeOverride {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) => ModuleTypeOverride::Letter(letter),
        _ => ModuleTypeOverride::Directory(value.to_owned()),
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
