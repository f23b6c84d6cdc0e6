//! Load testing of built modules against the running kernel.
//!
//! A package is only reported installable once its modules have been
//! inserted into the running kernel and removed again. [`loader`] performs
//! the insertions, [`system`] wraps the kernel state and daemons touched
//! around them, [`classify`] decides what a failed insertion means, and
//! [`tester`] sequences the whole test.

pub mod classify;
pub mod loader;
pub mod system;
pub mod tester;

pub use classify::{SignaturePolicy, signature_cause};
pub use loader::{LoadError, ModuleLoader, ProcessLoader, SyscallLoader, select_loader};
pub use system::{
    DependencyLoader, EventQueue, KernelState, ModprobeDependencies, SystemKernelState,
    UdevEventQueue, secure_boot_enabled,
};
pub use tester::{LoadTestReport, LoadTestRequest, LoadTester, OptionalLoadFailure};
