//! Error types for bundle manifests and precompiled artefacts.
//!
//! Each variant names the offending entry and the constraint that was
//! violated.

use thiserror::Error;

/// Errors arising from invalid bundle contents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtefactError {
    /// A schema version is outside the accepted range.
    #[error("unsupported bundle schema version {value}; current maximum is {max}")]
    UnsupportedSchemaVersion {
        /// The rejected version number.
        value: u32,
        /// The highest version this build understands.
        max: u32,
    },

    /// A SHA-256 digest is not a valid 64-character hex string.
    #[error("invalid SHA-256 digest: {reason}")]
    InvalidSha256Digest {
        /// Description of the validation failure.
        reason: String,
    },

    /// The bundle has no manifest or the manifest cannot be parsed.
    #[error("invalid bundle manifest: {reason}")]
    InvalidManifest {
        /// Description of the parse failure.
        reason: String,
    },

    /// An interface artefact does not name its core object.
    #[error("interface artefact {payload} does not name a core object")]
    MissingCoreObject {
        /// Payload name of the artefact.
        payload: String,
    },

    /// A complete-module artefact names a core object.
    #[error("module artefact {payload} unexpectedly names a core object")]
    UnexpectedCoreObject {
        /// Payload name of the artefact.
        payload: String,
    },

    /// The detached signature and CRC attributes disagree.
    #[error("artefact {payload} records a detached signature and a CRC inconsistently")]
    InconsistentSignature {
        /// Payload name of the artefact.
        payload: String,
    },

    /// The attribute bitset contains unknown bits.
    #[error("artefact {payload} has unknown attribute bits {bits:#04x}")]
    UnknownAttributes {
        /// Payload name of the artefact.
        payload: String,
        /// The unknown bits.
        bits: u8,
    },

    /// A name that becomes part of a path is not a single plain component.
    #[error("artefact {payload} has unsafe {field} {value:?}; expected a plain file or directory name")]
    UnsafePathName {
        /// Payload name of the artefact.
        payload: String,
        /// Manifest field holding the name.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A file referenced by the manifest is missing from the bundle.
    #[error("bundle file {name} is missing")]
    MissingFile {
        /// Name of the missing file.
        name: String,
    },

    /// A bundle file does not match its recorded digest.
    #[error("bundle file {name} has digest {actual}, expected {expected}")]
    DigestMismatch {
        /// Name of the file.
        name: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest of the unpacked file.
        actual: String,
    },

    /// A detached signature does not have its recorded length.
    #[error("detached signature {name} is {actual} bytes, expected {expected}")]
    SignatureLengthMismatch {
        /// Name of the signature file.
        name: String,
        /// Length recorded in the manifest.
        expected: usize,
        /// Length of the unpacked file.
        actual: usize,
    },
}

/// Result type alias using [`ArtefactError`].
pub type Result<T> = std::result::Result<T, ArtefactError>;
