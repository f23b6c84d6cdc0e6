//! Module signing and detached signatures.
//!
//! Modules are signed with the kernel's own `sign-file` helper, which
//! appends the signature to the module file. For interface artefacts the
//! module is linked, signed, and the appended signature is split off again
//! so the bundle can ship it separately. At install time the interface is
//! linked again and the signature is reattached only when the CRC of the
//! freshly linked module matches the CRC recorded at packaging time.

use crate::artefact::crc::file_crc32;
use crate::artefact::kind::ArtefactKind;
use crate::artefact::precompiled::{DetachedSignature, PrecompiledArtefact};
use crate::command::Invocation;
use crate::config::SigningOptions;
use crate::error::{InstallerError, Result};
use crate::paths::KernelPaths;
use crate::prompt::{Choice, Prompter};
use crate::toolchain::ToolchainRunner;
use camino::{Utf8Path, Utf8PathBuf};
use std::io::Write;

/// File name of the kernel's signing helper.
pub const SIGN_FILE: &str = "sign-file";

/// Feature test that reports the kernel's module signing hash.
pub const HASH_FEATURE_TEST: &str = "guess_module_signing_hash";

/// A configured module signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    sign_file: Utf8PathBuf,
    hash: String,
    secret_key: Utf8PathBuf,
    public_key: Utf8PathBuf,
}

impl Signer {
    /// Resolve the signing helper, hash algorithm, and keys.
    ///
    /// `build_dir` holds the feature-test script used to detect the hash.
    ///
    /// # Errors
    ///
    /// Returns an error naming the missing key, helper, or hash.
    pub fn prepare(
        options: &SigningOptions,
        runner: &mut ToolchainRunner<'_>,
        build_dir: &Utf8Path,
    ) -> Result<Self> {
        let secret_key = existing_key("secret", options.secret_key.as_deref())?;
        let public_key = existing_key("public", options.public_key.as_deref())?;
        let sign_file = locate_sign_file(runner.paths(), options.sign_file.as_deref())?;

        let hash = match options.hash.as_deref().map(str::trim) {
            Some(hash) if !hash.is_empty() => hash.to_owned(),
            _ => detect_hash(runner, build_dir)?,
        };
        log::info!("signing modules with {sign_file} using {hash}");

        Ok(Self {
            sign_file,
            hash,
            secret_key,
            public_key,
        })
    }

    /// Return the hash algorithm.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Sign `module` in place.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::SigningFailed`] when the helper exits
    /// unsuccessfully.
    pub fn sign(&self, runner: &mut ToolchainRunner<'_>, module: &Utf8Path) -> Result<()> {
        let invocation = Invocation::new(self.sign_file.as_str())
            .arg(self.hash.as_str())
            .arg(self.secret_key.as_str())
            .arg(self.public_key.as_str())
            .arg(module.as_str());
        let outcome = runner.run(&invocation)?;
        if outcome.success() {
            log::debug!("signed {module}");
            return Ok(());
        }
        Err(InstallerError::SigningFailed {
            module: module.file_name().unwrap_or(module.as_str()).to_owned(),
            reason: outcome.message(),
        })
    }
}

fn existing_key(which: &'static str, path: Option<&Utf8Path>) -> Result<Utf8PathBuf> {
    match path {
        Some(path) if path.is_file() => Ok(path.to_owned()),
        other => Err(InstallerError::SigningKeyMissing {
            which,
            path: other.map(Utf8Path::to_owned),
        }),
    }
}

fn detect_hash(runner: &mut ToolchainRunner<'_>, build_dir: &Utf8Path) -> Result<String> {
    let result = runner.run_feature_test(build_dir, HASH_FEATURE_TEST, &[])?;
    let hash = result.message.lines().last().unwrap_or_default().trim();
    if !result.passed || hash.is_empty() || hash.contains(char::is_whitespace) {
        return Err(InstallerError::SigningHashUnresolved {
            reason: if result.message.is_empty() {
                "the hash check produced no output".to_owned()
            } else {
                result.message
            },
        });
    }
    Ok(hash.to_owned())
}

/// Locate the kernel's `sign-file` helper.
///
/// An explicit path must be an executable file. Otherwise the `scripts`
/// directory of the output path is searched, then that of the source path.
///
/// # Errors
///
/// Returns [`InstallerError::SignFileNotFound`] naming the searched paths.
pub fn locate_sign_file(paths: &KernelPaths, explicit: Option<&Utf8Path>) -> Result<Utf8PathBuf> {
    let candidates: Vec<Utf8PathBuf> = match explicit {
        Some(path) => vec![path.to_owned()],
        None => vec![
            paths.output.join("scripts").join(SIGN_FILE),
            paths.source.join("scripts").join(SIGN_FILE),
        ],
    };
    if let Some(found) = candidates.iter().find(|c| is_executable(c)) {
        return Ok(found.clone());
    }
    Err(InstallerError::SignFileNotFound {
        searched: candidates
            .iter()
            .map(|candidate| candidate.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn is_executable(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Link an interface object and its core object into `output`.
///
/// # Errors
///
/// Returns [`InstallerError::ToolFailed`] when the linker fails.
pub fn link_module(
    runner: &mut ToolchainRunner<'_>,
    linker: &str,
    interface: &Utf8Path,
    core_object: &Utf8Path,
    output: &Utf8Path,
) -> Result<()> {
    let invocation = Invocation::new(linker)
        .args(["-r", "-o"])
        .arg(output.as_str())
        .arg(interface.as_str())
        .arg(core_object.as_str());
    let outcome = runner.run(&invocation)?;
    if outcome.success() && output.is_file() {
        return Ok(());
    }
    Err(InstallerError::ToolFailed {
        command: invocation.command_line(),
        status: outcome.status,
        output: outcome.message(),
    })
}

/// Link, sign, and split the signature off an interface artefact.
///
/// On success the artefact records the CRC of the unsigned linked module and
/// the detached signature. On failure the artefact is left untouched and the
/// temporary linked module is removed.
///
/// # Errors
///
/// Propagates link and signing failures.
pub fn link_and_detach_signature(
    runner: &mut ToolchainRunner<'_>,
    signer: &Signer,
    linker: &str,
    build_dir: &Utf8Path,
    artefact: &mut PrecompiledArtefact,
) -> Result<()> {
    let ArtefactKind::Interface { core_object } = artefact.kind() else {
        return Err(InstallerError::SigningFailed {
            module: artefact.module_filename().to_owned(),
            reason: "only interface artefacts carry detached signatures".to_owned(),
        });
    };
    let interface = build_dir.join(artefact.payload());
    let core = build_dir.join(core_object);
    let linked = build_dir.join(format!("{}.detach", artefact.module_filename()));

    let result = link_sign_split(runner, signer, linker, &interface, &core, &linked);
    if linked.exists() {
        if let Err(err) = std::fs::remove_file(&linked) {
            log::warn!("unable to remove {linked}: {err}");
        }
    }
    artefact.set_detached_signature(result?);
    Ok(())
}

fn link_sign_split(
    runner: &mut ToolchainRunner<'_>,
    signer: &Signer,
    linker: &str,
    interface: &Utf8Path,
    core: &Utf8Path,
    linked: &Utf8Path,
) -> Result<DetachedSignature> {
    link_module(runner, linker, interface, core, linked)?;
    let crc = file_crc32(linked.as_std_path())?;
    let unsigned_len = usize::try_from(std::fs::metadata(linked)?.len()).unwrap_or(usize::MAX);

    signer.sign(runner, linked)?;

    let signed = std::fs::read(linked)?;
    let signature = signed.get(unsigned_len..).unwrap_or_default().to_vec();
    if signature.is_empty() {
        return Err(InstallerError::SigningFailed {
            module: linked.file_name().unwrap_or(linked.as_str()).to_owned(),
            reason: "the signing helper did not append a signature".to_owned(),
        });
    }
    Ok(DetachedSignature { crc, signature })
}

/// Result of reattaching a detached signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The signature was appended.
    Signed,
    /// The operator chose to install the module without its signature.
    Unsigned,
    /// The artefact carries no detached signature.
    NoSignature,
}

/// Reattach `artefact`'s detached signature to the freshly linked module.
///
/// The signature is appended only when the module's CRC matches the CRC
/// recorded with the signature. On a mismatch or I/O failure the operator
/// chooses between installing the module unsigned and aborting.
///
/// # Errors
///
/// Returns [`InstallerError::Aborted`] when the operator aborts.
pub fn attach_detached_signature(
    linked: &Utf8Path,
    artefact: &PrecompiledArtefact,
    prompter: &dyn Prompter,
) -> Result<AttachOutcome> {
    let Some(detached) = artefact.detached_signature() else {
        return Ok(AttachOutcome::NoSignature);
    };

    let problem = match file_crc32(linked.as_std_path()) {
        Ok(crc) if crc == detached.crc => match append_signature(linked, &detached.signature) {
            Ok(()) => return Ok(AttachOutcome::Signed),
            Err(err) => format!("unable to append the signature to {linked}: {err}"),
        },
        Ok(crc) => format!(
            "the linked module {linked} has CRC {crc:#010x} but its signature was made for CRC {:#010x}; \
             it was probably linked with a different toolchain",
            detached.crc
        ),
        Err(err) => format!("unable to read the linked module {linked}: {err}"),
    };

    log::warn!("{problem}");
    let question = format!(
        "The detached signature for {} cannot be attached: {problem}. \
         Install the module without a signature?",
        artefact.module_filename()
    );
    match prompter.choose(
        &question,
        "Install the unsigned module",
        "Abort installation",
        Choice::Abort,
    ) {
        Choice::Proceed => {
            log::warn!(
                "installing {} without its signature at the operator's request",
                artefact.module_filename()
            );
            Ok(AttachOutcome::Unsigned)
        }
        Choice::Abort => Err(InstallerError::Aborted { reason: problem }),
    }
}

fn append_signature(path: &Utf8Path, signature: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    let original_len = file.metadata()?.len();
    let written = file.write_all(signature).and_then(|()| file.flush());
    if written.is_err() {
        // Leave the module exactly as linked.
        file.set_len(original_len)?;
    }
    written
}

#[cfg(test)]
#[path = "signing_tests.rs"]
mod tests;
