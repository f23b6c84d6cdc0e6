//! Artefact kinds.

use std::fmt;

/// What a precompiled artefact contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtefactKind {
    /// A per-kernel interface object, linked against the shipped core object
    /// at install time.
    Interface {
        /// File name of the core object the interface links against.
        core_object: String,
    },
    /// A complete, ready-to-load kernel module.
    Module,
}

impl ArtefactKind {
    /// Return the core object reference of an interface artefact.
    #[must_use]
    pub fn core_object(&self) -> Option<&str> {
        match self {
            Self::Interface { core_object } => Some(core_object),
            Self::Module => None,
        }
    }

    /// Return the tag written to bundle manifests.
    #[must_use]
    pub fn tag(&self) -> KindTag {
        match self {
            Self::Interface { .. } => KindTag::Interface,
            Self::Module => KindTag::Module,
        }
    }
}

impl fmt::Display for ArtefactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interface { core_object } => write!(f, "interface (core object {core_object})"),
            Self::Module => f.write_str("kernel module"),
        }
    }
}

/// Serialized artefact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindTag {
    /// An interface object.
    Interface,
    /// A complete module.
    Module,
}
