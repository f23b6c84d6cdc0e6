//! Classification of module load failures.

use super::loader::LoadError;
use crate::error::InstallerError;
use crate::pipeline::BuiltModule;
use crate::prompt::{Choice, Prompter};
use nix::errno::Errno;

/// Feature test reporting whether the target kernel enforces module
/// signatures (`CONFIG_MODULE_SIG_FORCE`).
pub const SIGNATURE_ENFORCEMENT_TEST: &str = "module_signature_enforced";

/// Signature trust settings of the running system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignaturePolicy {
    /// Secure boot is active.
    pub secure_boot: bool,
    /// The kernel refuses unsigned modules.
    pub signatures_enforced: bool,
}

/// How probably a load failure was caused by signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCause {
    /// The kernel reported that no trusted key is available.
    Certain,
    /// The kernel only admits trusted modules, so a rejection most likely
    /// came from signature verification.
    Likely,
    /// Nothing points at signature verification.
    Unlikely,
}

/// What the load test does after a failed insertion.
#[derive(Debug)]
pub enum FailureDecision {
    /// The operator accepted the module; later load tests are skipped.
    Ignore,
    /// The failure ends the load test.
    Fatal(InstallerError),
}

/// Determine how likely `errno` is to be a signature failure under `policy`.
#[must_use]
pub fn signature_cause(errno: Errno, policy: SignaturePolicy) -> SignatureCause {
    if errno == Errno::ENOKEY {
        SignatureCause::Certain
    } else if policy.secure_boot || policy.signatures_enforced {
        SignatureCause::Likely
    } else {
        SignatureCause::Unlikely
    }
}

/// Decide whether the failure to load `module` can be ignored.
///
/// A probable signature failure on a module that carries a signature is put
/// to the operator; on an unsigned module it is fatal because signing is the
/// only remedy. Every other failure is fatal and quotes `kernel_log`.
pub fn classify_failure(
    module: &BuiltModule,
    err: &LoadError,
    policy: SignaturePolicy,
    prompter: &dyn Prompter,
    kernel_log: &str,
) -> FailureDecision {
    let cause = signature_cause(err.errno, policy);
    if cause == SignatureCause::Unlikely {
        log::error!("{} failed to load: {err}", module.name);
        let mut reason = err.to_string();
        if !kernel_log.trim().is_empty() {
            reason.push_str("\nkernel log:\n");
            reason.push_str(kernel_log.trim_end());
        }
        return FailureDecision::Fatal(InstallerError::LoadFailed {
            module: module.name.clone(),
            reason,
        });
    }

    let certainty = match cause {
        SignatureCause::Certain => "because no trusted key is available",
        _ => "most likely because the kernel does not trust its signature",
    };
    log::warn!("{} failed to load {certainty}: {err}", module.name);

    if !module.signed {
        return FailureDecision::Fatal(InstallerError::SignatureRequired {
            module: module.name.clone(),
        });
    }

    let question = format!(
        "The signed kernel module {} failed to load {certainty}. \
         If its key will be enrolled before the next boot, the module can be installed anyway.",
        module.name
    );
    match prompter.choose(
        &question,
        "Install the signed module anyway",
        "Abort installation",
        Choice::Abort,
    ) {
        Choice::Proceed => {
            log::info!("installing {} without a successful load test", module.name);
            FailureDecision::Ignore
        }
        Choice::Abort => FailureDecision::Fatal(InstallerError::Aborted {
            reason: format!("the kernel rejected the signature of {}", module.name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_spec::ModuleName;
    use crate::prompt::MockPrompter;
    use camino::Utf8PathBuf;
    use rstest::rstest;

    fn module(signed: bool) -> BuiltModule {
        BuiltModule {
            name: ModuleName::from("core"),
            path: Utf8PathBuf::from("/pkg/kernel/core.ko"),
            signed,
        }
    }

    fn policy(secure_boot: bool, signatures_enforced: bool) -> SignaturePolicy {
        SignaturePolicy {
            secure_boot,
            signatures_enforced,
        }
    }

    #[rstest]
    #[case::no_key(Errno::ENOKEY, policy(false, false), SignatureCause::Certain)]
    #[case::secure_boot(Errno::EPERM, policy(true, false), SignatureCause::Likely)]
    #[case::enforced(Errno::EKEYREJECTED, policy(false, true), SignatureCause::Likely)]
    #[case::plain(Errno::ENOEXEC, policy(false, false), SignatureCause::Unlikely)]
    fn signature_cause_escalates_with_policy(
        #[case] errno: Errno,
        #[case] policy: SignaturePolicy,
        #[case] expected: SignatureCause,
    ) {
        assert_eq!(signature_cause(errno, policy), expected);
    }

    #[rstest]
    #[case::proceed(Choice::Proceed, true)]
    #[case::abort(Choice::Abort, false)]
    fn signed_module_offers_install_anyway(#[case] answer: Choice, #[case] ignored: bool) {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_choose()
            .withf(|_, proceed, _, default| {
                proceed == "Install the signed module anyway" && *default == Choice::Abort
            })
            .times(1)
            .return_const(answer);
        let err = LoadError::new(Errno::ENOKEY, "unable to insert core.ko");

        let decision = classify_failure(&module(true), &err, SignaturePolicy::default(), &prompter, "");

        match decision {
            FailureDecision::Ignore => assert!(ignored),
            FailureDecision::Fatal(InstallerError::Aborted { .. }) => assert!(!ignored),
            FailureDecision::Fatal(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsigned_module_requires_signing_without_prompting() {
        let prompter = MockPrompter::new();
        let err = LoadError::new(Errno::EKEYREJECTED, "unable to insert core.ko");

        let decision = classify_failure(&module(false), &err, policy(true, false), &prompter, "");

        assert!(matches!(
            decision,
            FailureDecision::Fatal(InstallerError::SignatureRequired { .. })
        ));
    }

    #[test]
    fn other_failures_quote_the_kernel_log() {
        let prompter = MockPrompter::new();
        let err = LoadError::new(Errno::ENOEXEC, "unable to insert core.ko");

        let decision = classify_failure(
            &module(true),
            &err,
            SignaturePolicy::default(),
            &prompter,
            "core: disagrees about version of symbol module_layout\n",
        );

        let FailureDecision::Fatal(InstallerError::LoadFailed { reason, .. }) = decision else {
            panic!("expected a load failure");
        };
        assert!(reason.contains("Exec format error"));
        assert!(reason.contains("disagrees about version"));
    }
}
