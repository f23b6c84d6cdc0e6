//! The precompiled artefact record.
//!
//! The attribute bitset is derived from the record's fields rather than
//! stored, so a detached signature can never be recorded without the CRC of
//! the linked module it was generated against.

use super::kind::ArtefactKind;
use crate::module_spec::{KernelModuleSpec, ModuleLayout};
use std::fmt;

/// Attribute bitset written to bundle manifests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes(u8);

impl Attributes {
    /// The artefact carries a detached signature.
    pub const DETACHED_SIGNATURE: Self = Self(0b001);
    /// The artefact records the CRC of the linked module.
    pub const LINKED_CRC: Self = Self(0b010);
    /// The payload carries an embedded signature.
    pub const EMBEDDED_SIGNATURE: Self = Self(0b100);
    /// Every known bit.
    pub const ALL: Self = Self(0b111);

    /// Create a bitset from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Return the raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Return true when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Return the bits not known to this version.
    #[must_use]
    pub const fn unknown(self) -> u8 {
        self.0 & !Self::ALL.0
    }

    #[must_use]
    const fn with(self, other: Self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | other.0)
        } else {
            self
        }
    }
}

/// A signature split off a linked module, with the CRC of the unsigned
/// module it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct DetachedSignature {
    /// CRC-32 of the linked module before signing.
    pub crc: u32,
    /// Signature bytes appended by the signer.
    pub signature: Vec<u8>,
}

impl fmt::Debug for DetachedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedSignature")
            .field("crc", &format_args!("{:#010x}", self.crc))
            .field("len", &self.signature.len())
            .finish()
    }
}

/// One packaged build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledArtefact {
    kind: ArtefactKind,
    payload: String,
    module_filename: String,
    target_dir: String,
    detached: Option<DetachedSignature>,
    embedded_signature: bool,
}

impl PrecompiledArtefact {
    /// Create an artefact of `kind`.
    #[must_use]
    pub fn new(
        kind: ArtefactKind,
        payload: impl Into<String>,
        module_filename: impl Into<String>,
        target_dir: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload: payload.into(),
            module_filename: module_filename.into(),
            target_dir: target_dir.into(),
            detached: None,
            embedded_signature: false,
        }
    }

    /// Describe the artefact packaged for `spec`.
    ///
    /// Modules with a separate interface are packaged as their interface
    /// object referencing the core object; other modules are packaged whole.
    #[must_use]
    pub fn for_module(spec: &KernelModuleSpec, target_dir: impl Into<String>) -> Self {
        match spec.layout() {
            ModuleLayout::SplitInterface {
                interface,
                core_object,
            } => Self::new(
                ArtefactKind::Interface {
                    core_object: core_object.clone(),
                },
                interface.clone(),
                spec.filename(),
                target_dir,
            ),
            ModuleLayout::SelfContained => {
                Self::new(ArtefactKind::Module, spec.filename(), spec.filename(), target_dir)
            }
        }
    }

    /// Return the artefact kind.
    #[must_use]
    pub fn kind(&self) -> &ArtefactKind {
        &self.kind
    }

    /// Return the payload file name.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Return the file name of the module this artefact installs.
    #[must_use]
    pub fn module_filename(&self) -> &str {
        &self.module_filename
    }

    /// Return the subdirectory the module is built in.
    #[must_use]
    pub fn target_dir(&self) -> &str {
        &self.target_dir
    }

    /// Return the detached signature, if any.
    #[must_use]
    pub fn detached_signature(&self) -> Option<&DetachedSignature> {
        self.detached.as_ref()
    }

    /// Record a detached signature and the CRC it belongs to.
    pub fn set_detached_signature(&mut self, detached: DetachedSignature) {
        self.detached = Some(detached);
    }

    /// Record that the payload carries an embedded signature.
    pub fn mark_embedded_signature(&mut self) {
        self.embedded_signature = true;
    }

    /// Return true when the payload carries an embedded signature.
    #[must_use]
    pub fn has_embedded_signature(&self) -> bool {
        self.embedded_signature
    }

    /// Return the attribute bitset.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        let detached = self.detached.is_some();
        Attributes::default()
            .with(Attributes::DETACHED_SIGNATURE, detached)
            .with(Attributes::LINKED_CRC, detached)
            .with(Attributes::EMBEDDED_SIGNATURE, self.embedded_signature)
    }
}
