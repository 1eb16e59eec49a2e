//! Identifier and image node types shared by the naming scheme and the engine.

use crate::codec::IdentifierCodec;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A `(version, release)` pair. Release 0 identifies a base, anything above a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub version: u64,
    pub release: u64,
}

impl Identifier {
    pub const fn new(version: u64, release: u64) -> Self {
        Self { version, release }
    }

    /// The identifier of the base for `version`.
    pub const fn base(version: u64) -> Self {
        Self {
            version,
            release: 0,
        }
    }

    pub const fn is_base(self) -> bool {
        self.release == 0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.release)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Base,
    Layer,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Base => f.write_str("base"),
            ImageKind::Layer => f.write_str("layer"),
        }
    }
}

/// In-memory projection of one base or layer volume.
///
/// Nodes are rebuilt from the live volume listing on every query and are
/// never persisted. The `kind` flag is fixed at construction from the
/// release number, so callers never have to guess from the rendered name
/// whether a volume is a base.
///
/// Equality and ordering only consider the volume group and the identifier;
/// the `layers` of a base do not take part in comparisons.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub vg: String,
    pub name: String,
    pub version: u64,
    pub release: u64,
    pub kind: ImageKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Image>,
}

impl Image {
    pub fn new(codec: &IdentifierCodec, vg: &str, id: Identifier) -> Self {
        Self {
            vg: vg.to_owned(),
            name: codec.render(id),
            version: id.version,
            release: id.release,
            kind: if id.is_base() {
                ImageKind::Base
            } else {
                ImageKind::Layer
            },
            layers: Vec::new(),
        }
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::new(self.version, self.release)
    }

    pub fn is_base(&self) -> bool {
        self.kind == ImageKind::Base
    }

    pub fn is_layer(&self) -> bool {
        self.kind == ImageKind::Layer
    }

    /// The `VG/LV` form used on LVM command lines.
    pub fn lvm_name(&self) -> String {
        format!("{}/{}", self.vg, self.name)
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.vg == other.vg && self.identifier() == other.identifier()
    }
}

impl Eq for Image {}

impl PartialOrd for Image {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Image {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identifier()
            .cmp(&other.identifier())
            .then_with(|| self.vg.cmp(&other.vg))
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
