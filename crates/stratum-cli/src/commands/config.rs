use super::{json_pretty, EXIT_SUCCESS};
use crate::settings::{config_err, SchemeOverrides, Settings};
use clap::Subcommand;
use std::collections::BTreeMap;
use std::path::PathBuf;
use stratum_schema::{
    Configuration, CoreSection, IdentifierCodec, PoolSection, Section, SectionValues,
};

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Print the effective settings and every configured section.
    Show,
    /// Set one `[core]` key in the user configuration file.
    Set {
        /// One of: vg, thinpool, layer-format, hooks-dir, boot-entries-dir, mode.
        key: String,
        value: String,
    },
    /// Remove a section from the user configuration file.
    Remove {
        /// Section type, e.g. core or pool.
        section_type: String,
        /// Section name, for named sections such as `pool <name>`.
        name: Option<String>,
    },
}

pub fn run(
    configuration: &Configuration,
    action: ConfigAction,
    overrides: &SchemeOverrides,
    dry: bool,
    json: bool,
) -> Result<u8, String> {
    match action {
        ConfigAction::Show => show(configuration, overrides, json),
        ConfigAction::Set { key, value } => set(configuration, &key, &value, dry),
        ConfigAction::Remove { section_type, name } => {
            remove(configuration, &section_type, name.as_deref(), dry)
        }
    }
}

fn show(
    configuration: &Configuration,
    overrides: &SchemeOverrides,
    json: bool,
) -> Result<u8, String> {
    let settings = Settings::load(configuration, overrides)?;
    let mut sections: BTreeMap<String, SectionValues> = BTreeMap::new();
    for section in configuration.sections(None).map_err(config_err)? {
        sections.insert(section.section_name(), section.save().map_err(config_err)?);
    }

    if json {
        let payload = serde_json::json!({
            "file": configuration.user_file(),
            "effective": {
                "vg": settings.scheme.vg,
                "thinpool": settings.scheme.thinpool,
                "layer_format": settings.scheme.layer_format,
                "hooks_dir": settings.hooks_dir,
                "boot_entries_dir": settings.entries_dir,
            },
            "sections": sections,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("vg:               {}", settings.scheme.vg);
    println!("thinpool:         {}", settings.scheme.thinpool);
    println!("layer format:     {}", settings.scheme.layer_format);
    println!("hooks dir:        {}", settings.hooks_dir.display());
    println!("boot entries dir: {}", settings.entries_dir.display());
    for (header, values) in sections {
        let body = toml::to_string(&values)
            .map_err(|e| format!("failed to render [{header}]: {e}"))?;
        println!();
        println!("[{header}]");
        print!("{body}");
    }
    Ok(EXIT_SUCCESS)
}

/// A `[core]` section carrying only `key`.
fn core_with(key: &str, value: &str) -> Result<CoreSection, String> {
    let mut core = CoreSection::default();
    match key {
        "vg" => core.vg = Some(value.to_owned()),
        "thinpool" => core.thinpool = Some(value.to_owned()),
        "layer-format" | "layer_format" => {
            IdentifierCodec::new(value).map_err(config_err)?;
            core.layer_format = Some(value.to_owned());
        }
        "hooks-dir" | "hooks_dir" => core.hooks_dir = Some(PathBuf::from(value)),
        "boot-entries-dir" | "boot_entries_dir" => {
            core.boot_entries_dir = Some(PathBuf::from(value));
        }
        "mode" => core.mode = Some(value.to_owned()),
        other => return Err(config_err(format!("unknown key '{other}'"))),
    }
    Ok(core)
}

fn set(configuration: &Configuration, key: &str, value: &str, dry: bool) -> Result<u8, String> {
    let core = core_with(key, value)?;
    let target = configuration.user_file().display();
    if dry {
        println!("dry run: would set core.{key} = {value} in {target}");
        return Ok(EXIT_SUCCESS);
    }
    configuration.save(&core).map_err(config_err)?;
    println!("set core.{key} = {value} in {target}");
    Ok(EXIT_SUCCESS)
}

fn remove(
    configuration: &Configuration,
    section_type: &str,
    name: Option<&str>,
    dry: bool,
) -> Result<u8, String> {
    let section: Box<dyn Section> = match (section_type, name) {
        (CoreSection::TYPE, None) => Box::new(CoreSection::default()),
        (PoolSection::TYPE, Some(name)) => Box::new(PoolSection::new(name)),
        (PoolSection::TYPE, None) => return Err(config_err("pool sections need a name")),
        (other, _) => return Err(config_err(format!("cannot remove section type '{other}'"))),
    };
    let header = section.section_name();
    let target = configuration.user_file().display();

    if dry {
        println!("dry run: would remove [{header}] from {target}");
        return Ok(EXIT_SUCCESS);
    }
    if configuration.remove(section.as_ref()).map_err(config_err)? {
        println!("removed [{header}] from {target}");
        Ok(EXIT_SUCCESS)
    } else {
        Err(format!("no section [{header}] in {target}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_writes_only_the_given_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        let configuration = Configuration::file(&path);

        set(&configuration, "vg", "DataVG", false).unwrap();
        set(&configuration, "hooks-dir", "/srv/hooks", false).unwrap();

        let core = configuration.core().unwrap();
        assert_eq!(core.vg.as_deref(), Some("DataVG"));
        assert_eq!(core.hooks_dir, Some(PathBuf::from("/srv/hooks")));
        assert_eq!(core.thinpool, None);
    }

    #[test]
    fn dry_set_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        set(&Configuration::file(&path), "vg", "DataVG", true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rejects_unknown_key_and_bad_format() {
        assert!(core_with("colour", "blue").unwrap_err().starts_with("config error:"));
        assert!(core_with("layer-format", "Image-%d")
            .unwrap_err()
            .starts_with("config error:"));
    }

    #[test]
    fn remove_pool_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        let configuration = Configuration::file(&path);
        let mut pool = PoolSection::new("main");
        pool.size = Some("20G".to_owned());
        configuration.save(&pool).unwrap();

        remove(&configuration, "pool", Some("main"), false).unwrap();
        assert!(configuration.pool("main").is_err());
        assert!(remove(&configuration, "pool", Some("main"), false).is_err());
        assert!(remove(&configuration, "pool", None, false)
            .unwrap_err()
            .starts_with("config error:"));
    }
}
