//! Bundle archive extraction.
//!
//! Bundles are unpacked into a scratch directory owned by the caller. Only
//! regular files are written; an entry naming an absolute path or climbing
//! out with `..` fails the whole extraction before anything is written for
//! it.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::io::Read;

/// Unpacks bundle archives.
#[cfg_attr(test, mockall::automock)]
pub trait ArtefactExtractor {
    /// Unpack `archive` below `dest` and return the archive-relative names
    /// of the files written.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractionError`] when the archive cannot be read, holds
    /// an unsafe or non UTF-8 entry name, or holds no files.
    fn extract(&self, archive: &Utf8Path, dest: &Utf8Path) -> Result<Vec<String>, ExtractionError>;
}

/// Why a bundle could not be unpacked.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// Reading the archive or writing a file failed.
    #[error("unable to unpack bundle: {0}")]
    Io(#[from] std::io::Error),

    /// An entry would be written outside the destination.
    #[error("bundle entry {entry} escapes the unpack directory")]
    Escapes {
        /// The entry name as stored in the archive.
        entry: String,
    },

    /// An entry name is not valid UTF-8.
    #[error("bundle entry {entry} is not a UTF-8 path")]
    NonUtf8Entry {
        /// Lossy rendering of the entry name.
        entry: String,
    },

    /// The archive holds no regular files.
    #[error("bundle archive contains no files")]
    Empty,
}

/// Unpacks `.tar.zst` bundles.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdExtractor;

impl ArtefactExtractor for ZstdExtractor {
    fn extract(&self, archive: &Utf8Path, dest: &Utf8Path) -> Result<Vec<String>, ExtractionError> {
        let decoder = zstd::Decoder::new(std::fs::File::open(archive)?)?;
        let mut tar = tar::Archive::new(decoder);
        let mut written = Vec::new();

        for entry in tar.entries()? {
            let mut entry = entry?;
            let name = entry_name(&entry)?;
            let target = destination(dest, &name)?;
            if !entry.header().entry_type().is_file() {
                log::debug!("{archive}: skipping non-file entry {name}");
                continue;
            }
            write_entry(&mut entry, &target)?;
            written.push(name.into_string());
        }

        if written.is_empty() {
            return Err(ExtractionError::Empty);
        }
        log::debug!("unpacked {} files from {archive} into {dest}", written.len());
        Ok(written)
    }
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Utf8PathBuf, ExtractionError> {
    let raw = entry.path()?.into_owned();
    Utf8PathBuf::from_path_buf(raw).map_err(|raw| ExtractionError::NonUtf8Entry {
        entry: raw.to_string_lossy().into_owned(),
    })
}

/// Resolve `name` below `dest`, refusing names that leave it.
fn destination(dest: &Utf8Path, name: &Utf8Path) -> Result<Utf8PathBuf, ExtractionError> {
    let safe = name
        .components()
        .all(|part| matches!(part, Utf8Component::Normal(_) | Utf8Component::CurDir));
    if !safe {
        return Err(ExtractionError::Escapes {
            entry: name.to_string(),
        });
    }
    Ok(dest.join(name))
}

fn write_entry<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Utf8Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(target)?;
    std::io::copy(entry, &mut file)?;
    Ok(())
}
