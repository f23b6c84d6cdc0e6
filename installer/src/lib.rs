//! kmodsmith installer library.
//!
//! This crate builds, signs, and load-tests the out-of-tree kernel modules of
//! a driver package against a target kernel, or installs them from a
//! precompiled bundle matching the running kernel. It is used by the
//! `kmodsmith-installer` CLI binary and can be driven programmatically for
//! testing or custom installation workflows.
//!
//! # Modules
//!
//! - [`artefact`] - Precompiled artefacts, bundles, and bundle search
//! - [`cli`] - Command-line argument definitions
//! - [`command`] - External command execution
//! - [`config`] - Package manifest and installer options
//! - [`error`] - Semantic error types with recovery hints
//! - [`install_flow`] - End-to-end installation
//! - [`kernel`] - Facts about the target kernel
//! - [`load_test`] - Load testing against the running kernel
//! - [`lock`] - Advisory lock serialising installer runs
//! - [`module_spec`] - Kernel module descriptions and the active module set
//! - [`output`] - Operator-facing progress output
//! - [`paths`] - Kernel source and output path resolution
//! - [`pipeline`] - Build pipeline orchestration
//! - [`precompiled_install`] - Installation from a precompiled bundle
//! - [`prompt`] - Operator prompts
//! - [`signing`] - Module signing and detached signatures
//! - [`toolchain`] - Feature tests and `make` invocations
//! - [`variant`] - Kernel module type selection

pub mod artefact;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod install_flow;
pub mod kernel;
pub mod load_test;
pub mod lock;
pub mod module_spec;
pub mod output;
pub mod paths;
pub mod pipeline;
pub mod precompiled_install;
pub mod prompt;
pub mod signing;
pub mod toolchain;
pub mod variant;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
