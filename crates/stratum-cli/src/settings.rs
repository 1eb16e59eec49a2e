use clap::Args;
use std::fmt::Display;
use std::path::PathBuf;
use stratum_core::{EngineConfig, DEFAULT_HOOKS_DIR};
use stratum_host::DEFAULT_ENTRIES_DIR;
use stratum_schema::{Configuration, CoreSection, SchemeConfig};

/// Scheme settings given on the command line; they win over config files.
#[derive(Debug, Clone, Default, Args)]
pub struct SchemeOverrides {
    /// Volume group holding bases and layers.
    #[arg(long, global = true)]
    pub vg: Option<String>,
    /// Thinpool new bases are allocated from.
    #[arg(long, global = true)]
    pub thinpool: Option<String>,
    /// Volume name template with two %d placeholders (version, release).
    #[arg(long, global = true)]
    pub layer_format: Option<String>,
}

impl SchemeOverrides {
    pub fn apply_to(&self, scheme: &mut SchemeConfig) {
        if let Some(vg) = &self.vg {
            scheme.vg.clone_from(vg);
        }
        if let Some(pool) = &self.thinpool {
            scheme.thinpool.clone_from(pool);
        }
        if let Some(format) = &self.layer_format {
            scheme.layer_format.clone_from(format);
        }
    }
}

pub fn config_err(e: impl Display) -> String {
    format!("config error: {e}")
}

/// Effective settings: defaults, then config files, then flags.
#[derive(Debug, Clone)]
pub struct Settings {
    pub scheme: SchemeConfig,
    pub hooks_dir: PathBuf,
    pub entries_dir: PathBuf,
}

impl Settings {
    pub fn load(
        configuration: &Configuration,
        overrides: &SchemeOverrides,
    ) -> Result<Self, String> {
        let core = configuration.core().map_err(config_err)?;
        Self::from_core(&core, overrides)
    }

    pub fn from_core(core: &CoreSection, overrides: &SchemeOverrides) -> Result<Self, String> {
        let mut scheme = SchemeConfig::default();
        core.apply_to(&mut scheme);
        overrides.apply_to(&mut scheme);
        scheme.codec().map_err(config_err)?;

        Ok(Self {
            scheme,
            hooks_dir: core
                .hooks_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOOKS_DIR)),
            entries_dir: core
                .boot_entries_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENTRIES_DIR)),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            scheme: self.scheme.clone(),
            hooks_dir: Some(self.hooks_dir.clone()),
        }
    }
}
