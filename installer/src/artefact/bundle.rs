//! Bundle manifest schema, reading, and unpacking.
//!
//! The manifest lists one record per artefact plus the SHA-256 digest of
//! every other file in the archive. Records are validated when the manifest
//! is parsed, so a bundle that violates an artefact invariant is never
//! offered as a match.

use super::error::{ArtefactError, Result as ArtefactResult};
use super::extraction::ArtefactExtractor;
use super::kind::{ArtefactKind, KindTag};
use super::precompiled::{Attributes, DetachedSignature, PrecompiledArtefact};
use super::sha256_digest::Sha256Digest;
use crate::error::Result;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

/// Name of the manifest inside every bundle.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Current manifest schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// File extension of bundle archives.
pub const BUNDLE_EXTENSION: &str = "tar.zst";

/// Serialized form of one artefact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtefactRecord {
    /// Artefact kind.
    pub kind: KindTag,
    /// Payload file name inside the bundle.
    pub payload: String,
    /// File name of the module the artefact installs.
    pub module_filename: String,
    /// Core object reference (interface artefacts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_object: Option<String>,
    /// Subdirectory the module is built in.
    pub target_dir: String,
    /// Attribute bitset.
    pub attributes: u8,
    /// CRC-32 of the linked module before signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc: Option<u32>,
    /// File holding the detached signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_file: Option<String>,
    /// Length of the detached signature in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_len: Option<usize>,
}

impl ArtefactRecord {
    /// Describe `artefact` for the manifest.
    #[must_use]
    pub fn from_artefact(artefact: &PrecompiledArtefact) -> Self {
        let detached = artefact.detached_signature();
        Self {
            kind: artefact.kind().tag(),
            payload: artefact.payload().to_owned(),
            module_filename: artefact.module_filename().to_owned(),
            core_object: artefact.kind().core_object().map(str::to_owned),
            target_dir: artefact.target_dir().to_owned(),
            attributes: artefact.attributes().bits(),
            crc: detached.map(|d| d.crc),
            signature_file: detached.map(|_| signature_file_name(artefact.payload())),
            signature_len: detached.map(|d| d.signature.len()),
        }
    }

    /// Check the record's internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> ArtefactResult<()> {
        self.validate_names()?;
        let attributes = Attributes::from_bits(self.attributes);
        if attributes.unknown() != 0 {
            return Err(ArtefactError::UnknownAttributes {
                payload: self.payload.clone(),
                bits: attributes.unknown(),
            });
        }

        match (self.kind, self.core_object.as_deref()) {
            (KindTag::Interface, None | Some("")) => {
                return Err(ArtefactError::MissingCoreObject {
                    payload: self.payload.clone(),
                });
            }
            (KindTag::Module, Some(_)) => {
                return Err(ArtefactError::UnexpectedCoreObject {
                    payload: self.payload.clone(),
                });
            }
            _ => {}
        }

        let detached = attributes.contains(Attributes::DETACHED_SIGNATURE);
        let crc = attributes.contains(Attributes::LINKED_CRC);
        let fields = [
            self.crc.is_some(),
            self.signature_file.is_some(),
            self.signature_len.is_some(),
        ];
        if detached != crc || fields.iter().any(|present| *present != detached) {
            return Err(ArtefactError::InconsistentSignature {
                payload: self.payload.clone(),
            });
        }
        Ok(())
    }

    /// Every name joined onto the unpack or install directory must be one
    /// plain path component.
    fn validate_names(&self) -> ArtefactResult<()> {
        let names = [
            ("payload", Some(self.payload.as_str())),
            ("module_filename", Some(self.module_filename.as_str())),
            ("target_dir", Some(self.target_dir.as_str())),
            ("core_object", self.core_object.as_deref()),
            ("signature_file", self.signature_file.as_deref()),
        ];
        for (field, value) in names {
            let Some(value) = value else { continue };
            if !is_plain_name(value) {
                return Err(ArtefactError::UnsafePathName {
                    payload: self.payload.clone(),
                    field,
                    value: value.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Build the artefact, attaching the unpacked signature bytes.
    fn into_artefact(self, signature: Option<Vec<u8>>) -> PrecompiledArtefact {
        let kind = match (self.kind, self.core_object) {
            (KindTag::Interface, Some(core_object)) => ArtefactKind::Interface { core_object },
            _ => ArtefactKind::Module,
        };
        let mut artefact =
            PrecompiledArtefact::new(kind, self.payload, self.module_filename, self.target_dir);
        if let (Some(crc), Some(signature)) = (self.crc, signature) {
            artefact.set_detached_signature(DetachedSignature { crc, signature });
        }
        if Attributes::from_bits(self.attributes).contains(Attributes::EMBEDDED_SIGNATURE) {
            artefact.mark_embedded_signature();
        }
        artefact
    }
}

fn is_plain_name(value: &str) -> bool {
    let mut components = Utf8Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Utf8Component::Normal(_)), None)
    )
}

/// Name of the file holding `payload`'s detached signature.
#[must_use]
pub fn signature_file_name(payload: &str) -> String {
    format!("{payload}.sig")
}

/// The manifest stored in every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    /// Manifest schema version.
    pub schema_version: u32,
    /// Human-readable kernel, OS, and architecture description.
    pub description: String,
    /// Proc-version signature of the kernel the bundle was built for.
    pub proc_version: String,
    /// Driver version the bundle was built from.
    pub driver_version: String,
    /// Artefacts in module load order.
    pub artefacts: Vec<ArtefactRecord>,
    /// Digest of every payload and signature file.
    pub files: BTreeMap<String, Sha256Digest>,
}

impl BundleManifest {
    /// Parse and validate manifest JSON.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, an unsupported schema version,
    /// an inconsistent record, or a record whose files are not listed.
    pub fn parse(json: &str) -> ArtefactResult<Self> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| ArtefactError::InvalidManifest {
                reason: e.to_string(),
            })?;
        if manifest.schema_version == 0 || manifest.schema_version > SCHEMA_VERSION {
            return Err(ArtefactError::UnsupportedSchemaVersion {
                value: manifest.schema_version,
                max: SCHEMA_VERSION,
            });
        }
        if let Some(name) = manifest.files.keys().find(|name| !is_plain_name(name)) {
            return Err(ArtefactError::UnsafePathName {
                payload: name.clone(),
                field: "files",
                value: name.clone(),
            });
        }
        for record in &manifest.artefacts {
            record.validate()?;
            let referenced = std::iter::once(&record.payload).chain(record.signature_file.as_ref());
            for name in referenced {
                if !manifest.files.contains_key(name) {
                    return Err(ArtefactError::MissingFile { name: name.clone() });
                }
            }
        }
        Ok(manifest)
    }

    /// Return true when the bundle was built for exactly this kernel and
    /// driver version and provides every expected module.
    #[must_use]
    pub fn matches(
        &self,
        proc_version: &str,
        driver_version: &str,
        expected_filenames: &[String],
    ) -> bool {
        self.proc_version == proc_version
            && self.driver_version == driver_version
            && expected_filenames
                .iter()
                .all(|name| self.record_for(name).is_some())
    }

    /// Return the record installing `module_filename`.
    #[must_use]
    pub fn record_for(&self, module_filename: &str) -> Option<&ArtefactRecord> {
        self.artefacts
            .iter()
            .find(|record| record.module_filename == module_filename)
    }
}

/// An unpacked artefact and the location of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedArtefact {
    /// The artefact, with its detached signature loaded.
    pub artefact: PrecompiledArtefact,
    /// Path of the unpacked payload.
    pub payload_path: Utf8PathBuf,
}

/// A bundle found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledBundle {
    path: Utf8PathBuf,
    manifest: BundleManifest,
}

impl PrecompiledBundle {
    /// Read the manifest of the bundle at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the archive cannot be read or its manifest is
    /// missing or invalid.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let decoder = zstd::Decoder::new(file)?;
        let mut archive = tar::Archive::new(decoder);

        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_os_str() != MANIFEST_NAME {
                continue;
            }
            let mut json = String::new();
            entry.read_to_string(&mut json)?;
            let manifest = BundleManifest::parse(&json)?;
            return Ok(Self {
                path: path.to_owned(),
                manifest,
            });
        }

        Err(ArtefactError::InvalidManifest {
            reason: format!("{path} contains no {MANIFEST_NAME}"),
        }
        .into())
    }

    /// Return the archive path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Return the manifest.
    #[must_use]
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Return the bundle description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.manifest.description
    }

    /// Unpack the bundle into `dest` and verify every file.
    ///
    /// Artefacts are returned in manifest order.
    ///
    /// # Errors
    ///
    /// Returns an error when extraction fails, a listed file is missing or
    /// does not match its digest, or a signature has the wrong length.
    pub fn unpack(
        &self,
        extractor: &dyn ArtefactExtractor,
        dest: &Utf8Path,
    ) -> Result<Vec<UnpackedArtefact>> {
        extractor.extract(&self.path, dest)?;

        for (name, expected) in &self.manifest.files {
            let path = dest.join(name);
            if !path.is_file() {
                return Err(ArtefactError::MissingFile { name: name.clone() }.into());
            }
            let actual = Sha256Digest::of_file(path.as_std_path())?;
            if actual != *expected {
                return Err(ArtefactError::DigestMismatch {
                    name: name.clone(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
        }

        let mut unpacked = Vec::with_capacity(self.manifest.artefacts.len());
        for record in self.manifest.artefacts.iter().cloned() {
            let signature = match (&record.signature_file, record.signature_len) {
                (Some(name), Some(expected)) => {
                    let bytes = std::fs::read(dest.join(name))?;
                    if bytes.len() != expected {
                        return Err(ArtefactError::SignatureLengthMismatch {
                            name: name.clone(),
                            expected,
                            actual: bytes.len(),
                        }
                        .into());
                    }
                    Some(bytes)
                }
                _ => None,
            };
            let payload_path = dest.join(&record.payload);
            unpacked.push(UnpackedArtefact {
                artefact: record.into_artefact(signature),
                payload_path,
            });
        }
        Ok(unpacked)
    }
}

#[cfg(test)]
#[path = "bundle_tests.rs"]
mod tests;
