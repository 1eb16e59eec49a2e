use super::{json_pretty, EXIT_SUCCESS};
use stratum_core::Engine;

pub fn run(engine: &Engine, units: &str, json: bool) -> Result<u8, String> {
    let free = engine.free_space(units).map_err(|e| e.to_string())?;
    let scheme = engine.scheme();
    if json {
        let payload = serde_json::json!({
            "pool": format!("{}/{}", scheme.vg, scheme.thinpool),
            "free": free,
            "units": units,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{free:.2}{units} free in {}/{}", scheme.vg, scheme.thinpool);
    }
    Ok(EXIT_SUCCESS)
}
