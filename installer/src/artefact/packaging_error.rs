//! Error types for bundle packaging.

use thiserror::Error;

/// Errors arising while writing a bundle.
#[derive(Debug, Error)]
pub enum PackagingError {
    /// An I/O operation failed (reading payloads, writing the archive).
    #[error("I/O error during packaging: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization of the manifest failed.
    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No artefacts were provided for packaging.
    #[error("no artefacts provided for packaging")]
    EmptyArtefactList,

    /// Two artefacts share a payload name.
    #[error("duplicate payload {0} in bundle")]
    DuplicatePayload(String),

    /// The generated manifest failed validation.
    #[error("generated manifest is invalid: {0}")]
    InvalidManifest(#[from] super::error::ArtefactError),
}
