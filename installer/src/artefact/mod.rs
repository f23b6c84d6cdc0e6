//! Precompiled artefacts and bundles.
//!
//! A bundle is a `.tar.zst` archive built for one exact kernel (identified by
//! its proc-version signature) and one driver version. It carries a
//! `manifest.json` describing every artefact, the artefact payloads, and any
//! detached signatures.
//!
//! # Sub-modules
//!
//! - [`error`]: Validation errors for manifests and artefacts.
//! - [`kind`]: Interface versus complete-module artefacts.
//! - [`precompiled`]: The artefact record and its attribute bitset.
//! - [`crc`]: CRC-32 of linked modules.
//! - [`sha256_digest`]: SHA-256 digest newtype used for payload checks.
//! - [`bundle`]: Bundle manifest schema, reading, and matching.
//! - [`extraction`]: Archive extraction with path traversal protection.
//! - [`packaging`]: Bundle creation.
//! - [`packaging_error`]: Errors raised while writing bundles.
//! - [`matcher`]: Priority-ordered bundle search.

pub mod bundle;
pub mod crc;
pub mod error;
pub mod extraction;
pub mod kind;
pub mod matcher;
pub mod packaging;
pub mod packaging_error;
pub mod precompiled;
pub mod sha256_digest;
