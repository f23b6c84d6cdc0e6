//! Kernel source and output path resolution.
//!
//! The source path is taken from the first available of: the explicit
//! option, the deprecated include-path option (its parent directory), the
//! `SYSSRC` environment variable, and a fixed list of filesystem
//! conventions. A path chosen explicitly by any of the first three sources
//! must be valid; it never falls back to the conventions.

use crate::config::Environment;
use crate::error::{InstallerError, Result};
use crate::kernel::SystemRoot;
use crate::prompt::Prompter;
use camino::{Utf8Path, Utf8PathBuf};

/// Header every kernel source tree must contain.
pub const KERNEL_HEADER: &str = "include/linux/kernel.h";

/// Number of times the operator is asked for a source path.
pub const PROMPT_ATTEMPTS: u32 = 3;

/// Resolved kernel build directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPaths {
    /// Kernel source tree.
    pub source: Utf8PathBuf,
    /// Kernel build output tree (configuration and generated headers).
    pub output: Utf8PathBuf,
}

/// Path overrides supplied by the operator.
#[derive(Debug, Clone, Copy)]
pub struct PathOverrides<'a> {
    /// `--kernel-source-path`.
    pub source: Option<&'a Utf8Path>,
    /// Deprecated `--kernel-include-path`.
    pub include: Option<&'a Utf8Path>,
    /// `--kernel-output-path`.
    pub output: Option<&'a Utf8Path>,
}

enum PromptOutcome {
    Resolved(Utf8PathBuf),
    Declined,
    Exhausted,
}

/// Resolves kernel paths for one kernel release.
pub struct PathResolver<'a> {
    root: &'a SystemRoot,
    env: &'a Environment,
    kernel: &'a str,
    prompter: Option<&'a dyn Prompter>,
}

impl<'a> PathResolver<'a> {
    /// Create a resolver for `kernel`, looking up conventions under `root`.
    #[must_use]
    pub fn new(root: &'a SystemRoot, env: &'a Environment, kernel: &'a str) -> Self {
        Self {
            root,
            env,
            kernel,
            prompter: None,
        }
    }

    /// Ask the operator for a path when no convention matches.
    #[must_use]
    pub fn interactive(mut self, prompter: &'a dyn Prompter) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Resolve both the source and the output path.
    ///
    /// # Errors
    ///
    /// Returns an error naming the rejected path or missing header.
    pub fn resolve(&self, overrides: PathOverrides<'_>) -> Result<KernelPaths> {
        let source = self.resolve_source(overrides.source, overrides.include)?;
        let output = self.resolve_output(&source, overrides.output)?;
        log::info!("kernel source path: {source}; output path: {output}");
        Ok(KernelPaths { source, output })
    }

    /// Resolve the kernel source path.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::KernelSourceNotFound`] when nothing matches,
    /// or a validation error for an explicitly chosen path.
    pub fn resolve_source(
        &self,
        explicit: Option<&Utf8Path>,
        include: Option<&Utf8Path>,
    ) -> Result<Utf8PathBuf> {
        if let Some(path) = explicit {
            return validate_source(path);
        }
        if let Some(include) = include {
            log::warn!("the kernel include path option is deprecated; use the kernel source path");
            let parent = include.parent().unwrap_or(include);
            return validate_source(parent);
        }
        if let Some(path) = &self.env.sys_src {
            return validate_source(path);
        }

        if let Some(found) = self
            .conventional_sources()
            .into_iter()
            .find(|candidate| validate_source(candidate).is_ok())
        {
            return Ok(found);
        }

        match self.prompter {
            Some(prompter) => match self.prompt_for_source(prompter) {
                PromptOutcome::Resolved(path) => Ok(path),
                PromptOutcome::Declined => Err(InstallerError::KernelSourceNotFound {
                    kernel: self.kernel.to_owned(),
                }),
                PromptOutcome::Exhausted => Err(InstallerError::PromptAttemptsExhausted {
                    attempts: PROMPT_ATTEMPTS,
                }),
            },
            None => Err(InstallerError::KernelSourceNotFound {
                kernel: self.kernel.to_owned(),
            }),
        }
    }

    /// Resolve the kernel output path for an already resolved source path.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::KernelPathMissing`] when an explicit output
    /// path does not exist.
    pub fn resolve_output(
        &self,
        source: &Utf8Path,
        explicit: Option<&Utf8Path>,
    ) -> Result<Utf8PathBuf> {
        if let Some(path) = explicit.or(self.env.sys_out.as_deref()) {
            if !path.is_dir() {
                return Err(InstallerError::KernelPathMissing {
                    what: "output",
                    path: path.to_owned(),
                });
            }
            return Ok(path.to_owned());
        }

        let modules = self.modules_dir();
        let build = modules.join("build");
        if source == modules.join("source") && build.is_dir() {
            return Ok(build);
        }
        Ok(source.to_owned())
    }

    fn modules_dir(&self) -> Utf8PathBuf {
        self.root.join(format!("lib/modules/{}", self.kernel))
    }

    fn conventional_sources(&self) -> Vec<Utf8PathBuf> {
        let modules = self.modules_dir();
        vec![
            modules.join("source"),
            modules.join("build/source"),
            modules.join("build"),
            self.root.join(format!("usr/src/linux-{}", self.kernel)),
            self.root.join("usr/src/linux"),
        ]
    }

    fn prompt_for_source(&self, prompter: &dyn Prompter) -> PromptOutcome {
        let question = format!(
            "Unable to find the kernel source tree for kernel {}. Enter the kernel source path:",
            self.kernel
        );
        for attempt in 1..=PROMPT_ATTEMPTS {
            let Some(answer) = prompter.ask_path(&question) else {
                return PromptOutcome::Declined;
            };
            match validate_source(Utf8Path::new(answer.trim())) {
                Ok(path) => return PromptOutcome::Resolved(path),
                Err(err) => log::warn!("attempt {attempt}/{PROMPT_ATTEMPTS}: {err}"),
            }
        }
        PromptOutcome::Exhausted
    }
}

fn validate_source(path: &Utf8Path) -> Result<Utf8PathBuf> {
    if !path.is_dir() {
        return Err(InstallerError::KernelPathMissing {
            what: "source",
            path: path.to_owned(),
        });
    }
    if !path.join(KERNEL_HEADER).is_file() {
        return Err(InstallerError::KernelHeaderMissing {
            path: path.to_owned(),
            header: KERNEL_HEADER,
        });
    }
    Ok(path.to_owned())
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
