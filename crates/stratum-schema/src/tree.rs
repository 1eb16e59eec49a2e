use crate::codec::IdentifierCodec;
use crate::naming::NamingError;
use crate::types::{Identifier, Image};
use tracing::{debug, trace};

/// Reconstruct the forest of bases and their layer chains from raw volume names.
///
/// Names that do not match the codec are foreign volumes and are skipped.
/// The remaining identifiers are sorted numerically, so the result does not
/// depend on the order of `names`. A layer must follow the base carrying the
/// same version; anything else is reported as an orphan.
pub fn build_tree<S: AsRef<str>>(
    codec: &IdentifierCodec,
    vg: &str,
    names: &[S],
) -> Result<Vec<Image>, NamingError> {
    let mut ids: Vec<Identifier> = names
        .iter()
        .filter_map(|name| {
            let name = name.as_ref();
            match codec.parse(name) {
                Ok(id) => Some(id),
                Err(_) => {
                    trace!("ignoring foreign volume '{name}'");
                    None
                }
            }
        })
        .collect();

    ids.sort_unstable();
    let before = ids.len();
    ids.dedup();
    if ids.len() != before {
        debug!(
            "collapsed {} duplicate identifiers in '{}'",
            before - ids.len(),
            vg
        );
    }

    let mut forest: Vec<Image> = Vec::new();
    for id in ids {
        if id.is_base() {
            forest.push(Image::new(codec, vg, id));
            continue;
        }
        match forest.last_mut() {
            Some(base) if base.version == id.version => {
                base.layers.push(Image::new(codec, vg, id));
            }
            _ => {
                return Err(NamingError::OrphanLayer {
                    layer: codec.render(id),
                    version: id.version,
                })
            }
        }
    }

    if forest.is_empty() {
        return Err(NamingError::NoBasesFound {
            inventory: names.iter().map(|n| n.as_ref().to_owned()).collect(),
        });
    }

    Ok(forest)
}
