//! CRC-32 checksums of linked kernel modules.
//!
//! A detached signature is only valid for the exact bytes it was generated
//! against, so the CRC of the linked module is recorded next to it and
//! recomputed before the signature is reattached.

use flate2::Crc;
use std::io::Read;
use std::path::Path;

/// Compute the CRC-32 of `bytes`.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// Compute the CRC-32 of the file at `path`.
///
/// # Errors
///
/// Returns any I/O error from reading the file.
pub fn file_crc32(path: &Path) -> std::io::Result<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut crc = Crc::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        let Some(chunk) = buffer.get(..read) else {
            break;
        };
        if chunk.is_empty() {
            break;
        }
        crc.update(chunk);
    }
    Ok(crc.sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_check_value() {
        // Standard CRC-32 check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn file_crc_matches_in_memory_crc() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("core.ko");
        let contents: Vec<u8> = (0..20_000u32)
            .map(|i| u8::try_from(i % 251).expect("fits in a byte"))
            .collect();
        std::fs::write(&path, &contents).expect("write");
        assert_eq!(file_crc32(&path).expect("crc"), crc32(&contents));
    }
}
