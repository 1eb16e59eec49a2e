use super::{colorize_state, json_pretty, EXIT_SUCCESS};
use stratum_core::Engine;

pub fn run(engine: &Engine, image: &str, json: bool) -> Result<u8, String> {
    let status = engine.inspect(image).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&status)?);
        return Ok(EXIT_SUCCESS);
    }

    let attrs = &status.attributes;
    println!("image:       {}", status.image.lvm_name());
    println!("kind:        {}", status.image.kind);
    println!("device:      {}", status.device);
    println!("state:       {}", colorize_state(&status.state.to_string()));
    if !status.settled {
        println!("             (interrupted, not settled)");
    }
    println!("permission:  {}", attrs.permission.as_lvm_arg());
    println!("active:      {}", if attrs.active { "yes" } else { "no" });
    println!("skip:        {}", if attrs.activation_skip { "yes" } else { "no" });
    println!("origin:      {}", attrs.origin.as_deref().unwrap_or("(none)"));
    if status.tags.is_empty() {
        println!("tags:        (none)");
    } else {
        println!("tags:        {}", status.tags.join(", "));
    }
    Ok(EXIT_SUCCESS)
}
