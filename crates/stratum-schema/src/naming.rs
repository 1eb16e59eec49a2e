use crate::codec::{FormatError, IdentifierCodec};
use crate::tree::build_tree;
use crate::types::{Identifier, Image};
use std::error::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NamingError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("layer '{layer}' has no base with version {version}")]
    OrphanLayer { layer: String, version: u64 },
    #[error("no bases found in {} inspected volume(s)", inventory.len())]
    NoBasesFound { inventory: Vec<String> },
    #[error("base '{base}' has no layers")]
    NoLayer { base: String },
    #[error("no valid layout found, initialize if needed ({0})")]
    NoValidLayout(Box<NamingError>),
    #[error("image '{0}' not found")]
    ImageNotFound(String),
    #[error("no identifier left after '{0}'")]
    Exhausted(String),
    #[error("failed to list volumes: {0}")]
    Inventory(Box<dyn Error + Send + Sync>),
}

/// Source of raw volume names.
///
/// Queried again on every naming operation; implementations must not cache.
pub trait Inventory {
    fn names(&self) -> Result<Vec<String>, NamingError>;
}

impl<S: AsRef<str>> Inventory for Vec<S> {
    fn names(&self) -> Result<Vec<String>, NamingError> {
        Ok(self.iter().map(|s| s.as_ref().to_owned()).collect())
    }
}

impl<S: AsRef<str>> Inventory for [S] {
    fn names(&self) -> Result<Vec<String>, NamingError> {
        Ok(self.iter().map(|s| s.as_ref().to_owned()).collect())
    }
}

impl<T: Inventory + ?Sized> Inventory for &T {
    fn names(&self) -> Result<Vec<String>, NamingError> {
        (**self).names()
    }
}

/// Inventory backed by a closure, re-evaluated on each query.
pub struct FnInventory<F>(F);

pub fn from_fn<F, E>(f: F) -> FnInventory<F>
where
    F: Fn() -> Result<Vec<String>, E>,
    E: Into<Box<dyn Error + Send + Sync>>,
{
    FnInventory(f)
}

impl<F, E> Inventory for FnInventory<F>
where
    F: Fn() -> Result<Vec<String>, E>,
    E: Into<Box<dyn Error + Send + Sync>>,
{
    fn names(&self) -> Result<Vec<String>, NamingError> {
        (self.0)().map_err(|e| NamingError::Inventory(e.into()))
    }
}

/// Answers "what comes next" for bases and layers of one volume group.
///
/// All queries rebuild the tree from the inventory. Suggestions are fresh
/// nodes; nothing on the host is renamed or created here.
pub struct NamingScheme<I> {
    codec: IdentifierCodec,
    vg: String,
    inventory: I,
}

impl<I: Inventory> NamingScheme<I> {
    pub fn new(codec: IdentifierCodec, vg: impl Into<String>, inventory: I) -> Self {
        Self {
            codec,
            vg: vg.into(),
            inventory,
        }
    }

    pub fn codec(&self) -> &IdentifierCodec {
        &self.codec
    }

    pub fn vg(&self) -> &str {
        &self.vg
    }

    pub fn tree(&self) -> Result<Vec<Image>, NamingError> {
        let names = self.inventory.names()?;
        build_tree(&self.codec, &self.vg, &names)
    }

    /// All bases in ascending order, each carrying its layers.
    pub fn bases(&self) -> Result<Vec<Image>, NamingError> {
        self.tree()
    }

    /// All layers of all bases in ascending order.
    pub fn layers(&self) -> Result<Vec<Image>, NamingError> {
        Ok(self
            .tree()?
            .into_iter()
            .flat_map(|base| base.layers)
            .collect())
    }

    pub fn last_base(&self) -> Result<Image, NamingError> {
        self.tree()?
            .pop()
            .ok_or_else(|| NamingError::NoBasesFound {
                inventory: Vec::new(),
            })
    }

    /// Last layer of `base`, or of the last base when `None`.
    pub fn last_layer(&self, base: Option<&Image>) -> Result<Image, NamingError> {
        let tree = self.tree()?;
        let base = select_base(&tree, base)?;
        base.layers
            .last()
            .cloned()
            .ok_or_else(|| NamingError::NoLayer {
                base: base.name.clone(),
            })
    }

    /// Next base identifier. An explicit `version` is taken verbatim and the
    /// inventory is not consulted; collisions are the caller's problem.
    pub fn suggest_next_base(&self, version: Option<u64>) -> Result<Image, NamingError> {
        let version = match version {
            Some(v) => v,
            None => match self.last_base() {
                Ok(last) => last
                    .version
                    .checked_add(1)
                    .ok_or(NamingError::Exhausted(last.name))?,
                Err(NamingError::NoBasesFound { .. }) => 0,
                Err(e) => return Err(e),
            },
        };
        Ok(Image::new(&self.codec, &self.vg, Identifier::base(version)))
    }

    /// Next layer on top of `base`, or of the last base when `None`.
    pub fn suggest_next_layer(&self, base: Option<&Image>) -> Result<Image, NamingError> {
        let tree = self.tree()?;
        let base = select_base(&tree, base)?;
        let release = match base.layers.last() {
            Some(last) => last
                .release
                .checked_add(1)
                .ok_or_else(|| NamingError::Exhausted(last.name.clone()))?,
            None => 1,
        };
        Ok(Image::new(
            &self.codec,
            &self.vg,
            Identifier::new(base.version, release),
        ))
    }

    pub fn layout(&self) -> Result<String, NamingError> {
        match self.tree() {
            Ok(tree) => Ok(render_layout(&tree)),
            Err(e @ (NamingError::NoBasesFound { .. } | NamingError::OrphanLayer { .. })) => {
                Err(NamingError::NoValidLayout(Box::new(e)))
            }
            Err(e) => Err(e),
        }
    }

    /// Parse a single volume name into a node of this scheme's volume group.
    pub fn image_from_name(&self, name: &str) -> Result<Image, NamingError> {
        let id = self.codec.parse(name)?;
        Ok(Image::new(&self.codec, &self.vg, id))
    }
}

fn select_base<'a>(tree: &'a [Image], base: Option<&Image>) -> Result<&'a Image, NamingError> {
    match base {
        Some(wanted) => tree
            .iter()
            .find(|b| b.identifier() == Identifier::base(wanted.version) && b.vg == wanted.vg)
            .ok_or_else(|| NamingError::ImageNotFound(wanted.name.clone())),
        None => tree.last().ok_or_else(|| NamingError::NoBasesFound {
            inventory: Vec::new(),
        }),
    }
}

/// Human-readable tree: one line per base, one connector line per layer.
pub fn render_layout(tree: &[Image]) -> String {
    let mut lines = Vec::new();
    for base in tree {
        lines.push(base.name.clone());
        for (idx, layer) in base.layers.iter().enumerate() {
            let connector = if idx + 1 == base.layers.len() {
                '└'
            } else {
                '├'
            };
            lines.push(format!(" {connector}╼ {}", layer.name));
        }
    }
    lines.join("\n")
}
