use super::{host_lock, json_pretty, with_spinner, EXIT_SUCCESS};
use crate::settings::config_err;
use stratum_core::Engine;
use stratum_host::Size;
use stratum_schema::Configuration;

#[derive(Debug, Clone, Copy)]
pub struct InitArgs<'a> {
    pub size: Option<&'a str>,
    pub pvs: &'a [String],
    pub pool: Option<&'a str>,
    pub from: Option<&'a str>,
}

/// Pool size and physical volumes from the flags, falling back to a
/// `[pool <name>]` section.
fn pool_plan(
    configuration: &Configuration,
    args: &InitArgs<'_>,
) -> Result<(Size, Vec<String>), String> {
    let section = match args.pool {
        Some(name) => Some(configuration.pool(name).map_err(config_err)?),
        None => None,
    };

    let size = match (args.size, section.as_ref().and_then(|s| s.size.as_deref())) {
        (Some(size), _) | (None, Some(size)) => size,
        (None, None) => {
            return Err(config_err(
                "init needs --size, a pool section with a size, or --from",
            ))
        }
    };
    let size = size.parse::<Size>().map_err(|e| e.to_string())?;

    let pvs = if args.pvs.is_empty() {
        section.map(|s| s.pvs).unwrap_or_default()
    } else {
        args.pvs.to_vec()
    };
    Ok((size, pvs))
}

pub fn run(
    engine: &Engine,
    configuration: &Configuration,
    args: &InitArgs<'_>,
    json: bool,
) -> Result<u8, String> {
    if let Some(existing) = args.from {
        let _lock = host_lock(engine)?;
        let (base, layer) = with_spinner(
            json,
            &format!("adopting {existing}..."),
            "layout initialized",
            "initialization failed",
            || engine.init_layout_from(existing),
        )?;
        if json {
            let payload = serde_json::json!({ "base": base, "layer": layer });
            println!("{}", json_pretty(&payload)?);
        } else {
            println!("base:  {}", base.lvm_name());
            println!("layer: {}", layer.lvm_name());
        }
        return Ok(EXIT_SUCCESS);
    }

    let (size, pvs) = pool_plan(configuration, args)?;
    let _lock = host_lock(engine)?;
    let pool = with_spinner(
        json,
        "creating thinpool...",
        "thinpool created",
        "thinpool creation failed",
        || engine.init_layout(&pvs, size),
    )?;
    if json {
        let payload = serde_json::json!({
            "pool": pool.lvm_name(),
            "size": size.to_string(),
            "pvs": pvs,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{pool} ({size})");
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args<'a>(size: Option<&'a str>, pvs: &'a [String], pool: Option<&'a str>) -> InitArgs<'a> {
        InitArgs {
            size,
            pvs,
            pool,
            from: None,
        }
    }

    #[test]
    fn size_flag_wins() {
        let dir = tempfile::tempdir().unwrap();
        let configuration = Configuration::file(dir.path().join("stratum.toml"));
        let (size, pvs) = pool_plan(&configuration, &args(Some("10G"), &[], None)).unwrap();
        assert_eq!(size.to_string(), "10G");
        assert!(pvs.is_empty());
    }

    #[test]
    fn pool_section_supplies_size_and_pvs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        std::fs::write(&path, "[\"pool main\"]\nsize = \"20G\"\npvs = [\"/dev/sdb\"]\n").unwrap();
        let configuration = Configuration::file(&path);

        let (size, pvs) = pool_plan(&configuration, &args(None, &[], Some("main"))).unwrap();
        assert_eq!(size.to_string(), "20G");
        assert_eq!(pvs, vec!["/dev/sdb".to_owned()]);

        let flags = vec!["/dev/sdc".to_owned()];
        let (_, pvs) = pool_plan(&configuration, &args(None, &flags, Some("main"))).unwrap();
        assert_eq!(pvs, flags);
    }

    #[test]
    fn missing_size_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let configuration = Configuration::file(dir.path().join("stratum.toml"));
        let err = pool_plan(&configuration, &args(None, &[], None)).unwrap_err();
        assert!(err.starts_with("config error:"));

        let err = pool_plan(&configuration, &args(None, &[], Some("absent"))).unwrap_err();
        assert!(err.starts_with("config error:"));
    }
}
