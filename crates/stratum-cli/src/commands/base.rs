use super::{host_lock, print_image, print_images, with_spinner, EXIT_SUCCESS};
use std::path::Path;
use stratum_core::{Engine, ImageSource};
use stratum_host::Size;

/// Today's date as a `YYYYMMDD` version number.
fn dated_version() -> Result<u64, String> {
    chrono::Local::now()
        .format("%Y%m%d")
        .to_string()
        .parse::<u64>()
        .map_err(|e| format!("invalid date version: {e}"))
}

pub fn add(
    engine: &Engine,
    size: &str,
    version: Option<u64>,
    dated: bool,
    from_image: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let size = size.parse::<Size>().map_err(|e| e.to_string())?;
    let version = if dated {
        Some(dated_version()?)
    } else {
        version
    };

    let source = from_image.map(ImageSource::from_arg);

    let _lock = host_lock(engine)?;
    let base = with_spinner(json, "creating base...", "base created", "base creation failed", || {
        match &source {
            Some(source) => engine.add_base_with_image(size, version, source.clone()),
            None => engine.add_base(size, version),
        }
    })?;
    print_image(&base, json)?;
    Ok(EXIT_SUCCESS)
}

pub fn list(engine: &Engine, json: bool) -> Result<u8, String> {
    let bases = engine.bases().map_err(|e| e.to_string())?;
    if bases.is_empty() && !json {
        println!("no bases found");
        return Ok(EXIT_SUCCESS);
    }
    print_images(&bases, json)?;
    Ok(EXIT_SUCCESS)
}

pub fn latest(engine: &Engine, json: bool) -> Result<u8, String> {
    let base = engine.latest_base().map_err(|e| e.to_string())?;
    print_image(&base, json)?;
    Ok(EXIT_SUCCESS)
}

pub fn of_layer(engine: &Engine, layer: &str, json: bool) -> Result<u8, String> {
    let base = engine.base_of_layer(layer).map_err(|e| e.to_string())?;
    print_image(&base, json)?;
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dated_version_has_eight_digits() {
        let version = dated_version().unwrap();
        assert_eq!(version.to_string().len(), 8);
        assert!(version > 2000_01_01);
    }
}
