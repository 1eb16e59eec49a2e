use super::{json_pretty, EXIT_SUCCESS};
use stratum_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    if json {
        let bases = engine.bases().map_err(|e| e.to_string())?;
        println!("{}", json_pretty(&bases)?);
    } else {
        let layout = engine.layout().map_err(|e| e.to_string())?;
        print!("{layout}");
    }
    Ok(EXIT_SUCCESS)
}
