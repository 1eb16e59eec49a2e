//! Identifier codec, image tree reconstruction, naming scheme, and configuration for Stratum.
//!
//! This crate defines the read side of the layering model: the two-integer
//! identifier template (`IdentifierCodec`), the in-memory `Image` projection of
//! bases and their layer chains, the tree builder that reconstructs that
//! projection from a flat volume listing, the `NamingScheme` that proposes the
//! next base or layer identifier, and the layered TOML configuration with
//! registrable section types.

pub mod codec;
pub mod config;
pub mod naming;
pub mod tree;
pub mod types;

pub use codec::{FormatError, IdentifierCodec, DEFAULT_LAYER_FORMAT};
pub use config::{
    ConfigError, Configuration, CoreSection, PoolSection, SchemeConfig, Section,
    SectionRegistry, SectionValues,
};
pub use naming::{from_fn, render_layout, FnInventory, Inventory, NamingError, NamingScheme};
pub use tree::build_tree;
pub use types::{Identifier, Image, ImageKind};
