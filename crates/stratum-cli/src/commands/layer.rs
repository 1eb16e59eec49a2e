use super::{host_lock, print_image, print_images, with_spinner, EXIT_SUCCESS};
use stratum_core::Engine;

pub fn add(engine: &Engine, json: bool) -> Result<u8, String> {
    let _lock = host_lock(engine)?;
    let layer = with_spinner(
        json,
        "adding bootable layer...",
        "layer added",
        "layer creation failed",
        || engine.add_bootable_layer(),
    )?;
    print_image(&layer, json)?;
    if !json {
        println!("reboot to switch to {}", layer.name);
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(engine: &Engine, json: bool) -> Result<u8, String> {
    let layers = engine.layers().map_err(|e| e.to_string())?;
    if layers.is_empty() && !json {
        println!("no layers found");
        return Ok(EXIT_SUCCESS);
    }
    print_images(&layers, json)?;
    Ok(EXIT_SUCCESS)
}

pub fn latest(engine: &Engine, json: bool) -> Result<u8, String> {
    let layer = engine.latest_layer().map_err(|e| e.to_string())?;
    print_image(&layer, json)?;
    Ok(EXIT_SUCCESS)
}

pub fn current(engine: &Engine, json: bool) -> Result<u8, String> {
    let layer = engine.current_layer().map_err(|e| e.to_string())?;
    print_image(&layer, json)?;
    Ok(EXIT_SUCCESS)
}
