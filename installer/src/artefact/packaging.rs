//! Bundle packaging.
//!
//! Writes a `.tar.zst` bundle containing `manifest.json`, every artefact
//! payload, and one file per detached signature. The manifest records the
//! SHA-256 digest of every payload and signature file.

use super::bundle::{ArtefactRecord, BundleManifest, MANIFEST_NAME, SCHEMA_VERSION};
use super::packaging_error::PackagingError;
use super::precompiled::PrecompiledArtefact;
use super::sha256_digest::Sha256Digest;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::io::Write;

/// An artefact and the built file holding its payload.
#[derive(Debug, Clone)]
pub struct PackagedFile {
    /// The artefact record.
    pub artefact: PrecompiledArtefact,
    /// Path of the payload on disk.
    pub payload_path: Utf8PathBuf,
}

/// Input parameters for [`package_bundle`].
#[derive(Debug)]
pub struct BundleParams {
    /// Kernel, OS, and architecture description.
    pub description: String,
    /// Proc-version signature of the kernel the artefacts were built for.
    pub proc_version: String,
    /// Driver version the artefacts were built from.
    pub driver_version: String,
    /// Artefacts in module load order.
    pub artefacts: Vec<PackagedFile>,
    /// Destination of the archive.
    pub archive_path: Utf8PathBuf,
}

/// Output produced by [`package_bundle`].
#[derive(Debug)]
pub struct PackageOutput {
    /// Path to the created archive.
    pub archive_path: Utf8PathBuf,
    /// The manifest stored in the archive.
    pub manifest: BundleManifest,
}

/// File name for a bundle of `package` version `driver_version` built for
/// kernel `release`.
#[must_use]
pub fn bundle_file_name(package: &str, driver_version: &str, release: &str) -> String {
    format!("{package}-{driver_version}-{release}.tar.zst")
}

/// Write a bundle.
///
/// The archive is written to a temporary file next to the destination and
/// renamed into place once complete.
///
/// # Errors
///
/// Returns [`PackagingError::EmptyArtefactList`] when there is nothing to
/// package, [`PackagingError::DuplicatePayload`] when two artefacts share a
/// payload name, or an I/O or serialization error.
pub fn package_bundle(params: &BundleParams) -> Result<PackageOutput, PackagingError> {
    if params.artefacts.is_empty() {
        return Err(PackagingError::EmptyArtefactList);
    }

    let mut files = BTreeMap::new();
    let mut records = Vec::with_capacity(params.artefacts.len());
    let mut signatures = Vec::new();
    for packaged in &params.artefacts {
        let artefact = &packaged.artefact;
        let digest = Sha256Digest::of_file(packaged.payload_path.as_std_path())?;
        if files.insert(artefact.payload().to_owned(), digest).is_some() {
            return Err(PackagingError::DuplicatePayload(artefact.payload().to_owned()));
        }

        let record = ArtefactRecord::from_artefact(artefact);
        if let (Some(name), Some(detached)) =
            (&record.signature_file, artefact.detached_signature())
        {
            files.insert(name.clone(), Sha256Digest::of_bytes(&detached.signature));
            signatures.push((name.clone(), detached.signature.clone()));
        }
        records.push(record);
    }

    let manifest = BundleManifest {
        schema_version: SCHEMA_VERSION,
        description: params.description.clone(),
        proc_version: params.proc_version.clone(),
        driver_version: params.driver_version.clone(),
        artefacts: records,
        files,
    };
    let json = serde_json::to_string_pretty(&manifest)?;
    BundleManifest::parse(&json)?;

    write_archive(params, json.as_bytes(), &signatures)?;
    log::info!(
        "wrote precompiled bundle {} ({} artefacts)",
        params.archive_path,
        manifest.artefacts.len()
    );

    Ok(PackageOutput {
        archive_path: params.archive_path.clone(),
        manifest,
    })
}

fn write_archive(
    params: &BundleParams,
    manifest_json: &[u8],
    signatures: &[(String, Vec<u8>)],
) -> Result<(), PackagingError> {
    let dir = params
        .archive_path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    std::fs::create_dir_all(dir)?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;

    {
        let encoder = zstd::Encoder::new(temp.as_file(), 0)?;
        let mut archive = tar::Builder::new(encoder);
        append_bytes(&mut archive, MANIFEST_NAME, manifest_json)?;
        for packaged in &params.artefacts {
            archive.append_path_with_name(&packaged.payload_path, packaged.artefact.payload())?;
        }
        for (name, bytes) in signatures {
            append_bytes(&mut archive, name, bytes)?;
        }
        let encoder = archive.into_inner()?;
        encoder.finish()?.flush()?;
    }

    temp.persist(&params.archive_path)
        .map_err(|err| PackagingError::Io(err.error))?;
    Ok(())
}

fn append_bytes<W: Write>(
    archive: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, name, bytes)
}

#[cfg(test)]
#[path = "packaging_tests.rs"]
mod tests;
