use crate::HostError;
use std::fs::File;
use std::io;
use std::path::Path;

/// Streaming blake3 digest of a block device (or any file), hex encoded.
pub fn digest_device(path: impl AsRef<Path>) -> Result<String, HostError> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}
