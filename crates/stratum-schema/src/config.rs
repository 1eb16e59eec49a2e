//! Layered TOML configuration.
//!
//! Files are read in order: the vendor file, the user file, then every
//! `*.toml` drop-in sorted by file name. A key set by a later file replaces
//! the same key of the same section in an earlier one. Each top-level table
//! is a section whose header is `"<type>"` or `"<type> <name>"`; the type
//! selects a constructor from the [`SectionRegistry`]. Writes only ever touch
//! the user file.

use crate::codec::{FormatError, IdentifierCodec, DEFAULT_LAYER_FORMAT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

pub const VENDOR_CONFIG_FILE: &str = "/usr/lib/stratum/stratum.toml";
pub const USER_CONFIG_FILE: &str = "/etc/stratum.toml";
pub const DROPIN_CONFIG_DIR: &str = "/etc/stratum.d";

pub type SectionValues = toml::Table;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("section '{0}' is not a table")]
    NotATable(String),
    #[error("unknown section type '{0}'")]
    UnknownSectionType(String),
    #[error("invalid section '{section}': {reason}")]
    InvalidSection { section: String, reason: String },
    #[error("section '{0}' not found")]
    SectionNotFound(String),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Volume group, thinpool and layer template the naming scheme works with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeConfig {
    pub vg: String,
    pub thinpool: String,
    pub layer_format: String,
}

impl Default for SchemeConfig {
    fn default() -> Self {
        Self {
            vg: "HostVG".to_owned(),
            thinpool: "ImagePool".to_owned(),
            layer_format: DEFAULT_LAYER_FORMAT.to_owned(),
        }
    }
}

impl SchemeConfig {
    pub fn codec(&self) -> Result<IdentifierCodec, FormatError> {
        IdentifierCodec::new(self.layer_format.as_str())
    }
}

/// A configuration section that can be written back to the user file.
pub trait Section: fmt::Debug {
    fn section_type(&self) -> &str;

    fn name(&self) -> Option<&str> {
        None
    }

    /// Table header: `"<type>"` or `"<type> <name>"`.
    fn section_name(&self) -> String {
        match self.name() {
            Some(name) => format!("{} {name}", self.section_type()),
            None => self.section_type().to_owned(),
        }
    }

    fn save(&self) -> Result<SectionValues, ConfigError>;

    fn as_any(&self) -> &dyn Any;
}

pub type SectionCtor = fn(Option<&str>, SectionValues) -> Result<Box<dyn Section>, ConfigError>;

fn from_values<T: DeserializeOwned>(header: &str, values: SectionValues) -> Result<T, ConfigError> {
    toml::Value::Table(values)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::InvalidSection {
            section: header.to_owned(),
            reason: e.message().to_owned(),
        })
}

fn to_values<T: Serialize>(header: &str, section: &T) -> Result<SectionValues, ConfigError> {
    match toml::Value::try_from(section)? {
        toml::Value::Table(table) => Ok(table),
        _ => Err(ConfigError::NotATable(header.to_owned())),
    }
}

/// `[core]`: scheme settings and host paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinpool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_entries_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl CoreSection {
    pub const TYPE: &'static str = "core";

    /// Overlay the values set in this section onto `scheme`.
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

impl Section for CoreSection {
    fn section_type(&self) -> &str {
        Self::TYPE
    }

    fn save(&self) -> Result<SectionValues, ConfigError> {
        to_values(Self::TYPE, self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `[pool <name>]`: sizing of a thinpool for `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pvs: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl PoolSection {
    pub const TYPE: &'static str = "pool";

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }
}

impl Section for PoolSection {
    fn section_type(&self) -> &str {
        Self::TYPE
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn save(&self) -> Result<SectionValues, ConfigError> {
        to_values(&self.section_name(), self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn build_core(_name: Option<&str>, values: SectionValues) -> Result<Box<dyn Section>, ConfigError> {
    Ok(Box::new(from_values::<CoreSection>(CoreSection::TYPE, values)?))
}

fn build_pool(name: Option<&str>, values: SectionValues) -> Result<Box<dyn Section>, ConfigError> {
    let name = name.ok_or_else(|| ConfigError::InvalidSection {
        section: PoolSection::TYPE.to_owned(),
        reason: "pool sections need a name".to_owned(),
    })?;
    let mut pool: PoolSection = from_values(&format!("{} {name}", PoolSection::TYPE), values)?;
    pool.name = name.to_owned();
    Ok(Box::new(pool))
}

/// Maps section type strings to constructors.
#[derive(Clone)]
pub struct SectionRegistry {
    ctors: BTreeMap<String, SectionCtor>,
}

impl Default for SectionRegistry {
    fn default() -> Self {
        let mut registry = Self {
            ctors: BTreeMap::new(),
        };
        registry.register(CoreSection::TYPE, build_core);
        registry.register(PoolSection::TYPE, build_pool);
        registry
    }
}

impl fmt::Debug for SectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ctors.keys()).finish()
    }
}

impl SectionRegistry {
    /// Register (or replace) the constructor for `section_type`.
    pub fn register(&mut self, section_type: &str, ctor: SectionCtor) {
        self.ctors.insert(section_type.to_owned(), ctor);
    }

    pub fn is_registered(&self, section_type: &str) -> bool {
        self.ctors.contains_key(section_type)
    }

    pub fn build(
        &self,
        header: &str,
        values: SectionValues,
    ) -> Result<Box<dyn Section>, ConfigError> {
        let (section_type, name) = split_header(header);
        let ctor = self
            .ctors
            .get(section_type)
            .ok_or_else(|| ConfigError::UnknownSectionType(section_type.to_owned()))?;
        ctor(name, values)
    }
}

fn split_header(header: &str) -> (&str, Option<&str>) {
    match header.split_once(' ') {
        Some((section_type, name)) if !name.trim().is_empty() => (section_type, Some(name.trim())),
        Some((section_type, _)) => (section_type, None),
        None => (header, None),
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    vendor_file: Option<PathBuf>,
    user_file: PathBuf,
    dropin_dir: Option<PathBuf>,
    registry: SectionRegistry,
}

impl Configuration {
    /// The system-wide locations under `/usr/lib` and `/etc`.
    pub fn system() -> Self {
        Self::with_paths(
            Some(PathBuf::from(VENDOR_CONFIG_FILE)),
            PathBuf::from(USER_CONFIG_FILE),
            Some(PathBuf::from(DROPIN_CONFIG_DIR)),
        )
    }

    /// A single file, used both for reading and writing.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_paths(None, path.into(), None)
    }

    pub fn with_paths(
        vendor_file: Option<PathBuf>,
        user_file: PathBuf,
        dropin_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            vendor_file,
            user_file,
            dropin_dir,
            registry: SectionRegistry::default(),
        }
    }

    pub fn user_file(&self) -> &Path {
        &self.user_file
    }

    pub fn registry_mut(&mut self) -> &mut SectionRegistry {
        &mut self.registry
    }

    fn read_order(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let mut files: Vec<PathBuf> = self.vendor_file.iter().cloned().collect();
        files.push(self.user_file.clone());

        if let Some(dir) = &self.dropin_dir {
            match fs::read_dir(dir) {
                Ok(entries) => {
                    let mut dropins = Vec::new();
                    for entry in entries {
                        let path = entry.map_err(io_err(dir))?.path();
                        if path.is_file() && path.extension().is_some_and(|e| e == "toml") {
                            dropins.push(path);
                        }
                    }
                    dropins.sort();
                    files.extend(dropins);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("no config drop-in directory at {}", dir.display());
                }
                Err(e) => return Err(io_err(dir)(e)),
            }
        }
        Ok(files)
    }

    fn merged(&self) -> Result<BTreeMap<String, SectionValues>, ConfigError> {
        let mut merged: BTreeMap<String, SectionValues> = BTreeMap::new();
        for path in self.read_order()? {
            let Some(table) = read_table(&path)? else {
                continue;
            };
            debug!("read config file {}", path.display());
            for (header, value) in table {
                let toml::Value::Table(values) = value else {
                    return Err(ConfigError::NotATable(header));
                };
                merged.entry(header).or_default().extend(values);
            }
        }
        Ok(merged)
    }

    /// All sections, optionally only those of one type, in header order.
    pub fn sections(
        &self,
        filter_type: Option<&str>,
    ) -> Result<Vec<Box<dyn Section>>, ConfigError> {
        let mut sections = Vec::new();
        for (header, values) in self.merged()? {
            if filter_type.is_some_and(|t| split_header(&header).0 != t) {
                continue;
            }
            sections.push(self.registry.build(&header, values)?);
        }
        Ok(sections)
    }

    pub fn section(
        &self,
        section_type: &str,
        name: Option<&str>,
    ) -> Result<Box<dyn Section>, ConfigError> {
        self.sections(Some(section_type))?
            .into_iter()
            .find(|s| name.is_none() || s.name() == name)
            .ok_or_else(|| {
                ConfigError::SectionNotFound(match name {
                    Some(n) => format!("{section_type} {n}"),
                    None => section_type.to_owned(),
                })
            })
    }

    /// The `[core]` section, or an empty one when none is configured.
    pub fn core(&self) -> Result<CoreSection, ConfigError> {
        match self.section(CoreSection::TYPE, None) {
            Ok(section) => Ok(downcast::<CoreSection>(section.as_ref())?.clone()),
            Err(ConfigError::SectionNotFound(_)) => Ok(CoreSection::default()),
            Err(e) => Err(e),
        }
    }

    pub fn pool(&self, name: &str) -> Result<PoolSection, ConfigError> {
        let section = self.section(PoolSection::TYPE, Some(name))?;
        Ok(downcast::<PoolSection>(section.as_ref())?.clone())
    }

    /// Write `section` into the user file, replacing the keys it sets.
    pub fn save(&self, section: &dyn Section) -> Result<(), ConfigError> {
        let mut table = read_table(&self.user_file)?.unwrap_or_default();
        let header = section.section_name();
        let values = section.save()?;

        let entry = table
            .entry(header.clone())
            .or_insert_with(|| toml::Value::Table(SectionValues::new()));
        let toml::Value::Table(existing) = entry else {
            return Err(ConfigError::NotATable(header));
        };
        existing.extend(values);

        self.write_user_file(&table)?;
        debug!("saved section [{header}] to {}", self.user_file.display());
        Ok(())
    }

    /// Drop `section` from the user file. Vendor and drop-in files are untouched.
    pub fn remove(&self, section: &dyn Section) -> Result<bool, ConfigError> {
        let header = section.section_name();
        let Some(mut table) = read_table(&self.user_file)? else {
            warn!("unknown section: {header}");
            return Ok(false);
        };
        if table.remove(&header).is_none() {
            warn!("unknown section: {header}");
            return Ok(false);
        }
        self.write_user_file(&table)?;
        Ok(true)
    }

    fn write_user_file(&self, table: &toml::Table) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(table)?;
        let dir = match self.user_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(content.as_bytes())
            .map_err(io_err(&self.user_file))?;
        tmp.as_file()
            .sync_all()
            .map_err(io_err(&self.user_file))?;
        tmp.persist(&self.user_file)
            .map_err(|e| io_err(&self.user_file)(e.error))?;
        Ok(())
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    content
        .parse::<toml::Table>()
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn downcast<T: 'static>(section: &dyn Section) -> Result<&T, ConfigError> {
    section
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ConfigError::InvalidSection {
            section: section.section_name(),
            reason: "registered constructor returned an unexpected type".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn layered(dir: &Path) -> Configuration {
        Configuration::with_paths(
            Some(dir.join("vendor/stratum.toml")),
            dir.join("etc/stratum.toml"),
            Some(dir.join("etc/stratum.d")),
        )
    }

    #[test]
    fn defaults_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = layered(dir.path());
        assert_eq!(config.core().unwrap(), CoreSection::default());
        assert!(config.sections(None).unwrap().is_empty());

        let mut scheme = SchemeConfig::default();
        config.core().unwrap().apply_to(&mut scheme);
        assert_eq!(scheme, SchemeConfig::default());
        assert_eq!(scheme.layer_format, "Image-%d.%d");
    }

    #[test]
    fn later_files_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let config = layered(dir.path());
        write(
            &dir.path().join("vendor/stratum.toml"),
            "[core]\nvg = \"VendorVG\"\nthinpool = \"VendorPool\"\n",
        );
        write(&dir.path().join("etc/stratum.toml"), "[core]\nvg = \"UserVG\"\n");
        write(
            &dir.path().join("etc/stratum.d/20-format.toml"),
            "[core]\nlayer_format = \"root-%d-%d\"\n",
        );
        write(
            &dir.path().join("etc/stratum.d/10-format.toml"),
            "[core]\nlayer_format = \"ignored-%d-%d\"\nmode = \"strict\"\n",
        );
        write(&dir.path().join("etc/stratum.d/notes.txt"), "not toml");

        let core = config.core().unwrap();
        assert_eq!(core.vg.as_deref(), Some("UserVG"));
        assert_eq!(core.thinpool.as_deref(), Some("VendorPool"));
        assert_eq!(core.layer_format.as_deref(), Some("root-%d-%d"));
        assert_eq!(core.mode.as_deref(), Some("strict"));

        let mut scheme = SchemeConfig::default();
        core.apply_to(&mut scheme);
        assert_eq!(scheme.vg, "UserVG");
        assert_eq!(scheme.codec().unwrap().format(), "root-%d-%d");
    }

    #[test]
    fn named_sections_and_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        write(
            &path,
            "[core]\nmode = \"1\"\n\n[\"pool ImagePool\"]\nsize = \"20G\"\npvs = [\"/dev/sda2\"]\n",
        );
        let config = Configuration::file(&path);

        let all = config.sections(None).unwrap();
        assert_eq!(all.len(), 2);
        let pools = config.sections(Some("pool")).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].section_name(), "pool ImagePool");

        let pool = config.pool("ImagePool").unwrap();
        assert_eq!(pool.size.as_deref(), Some("20G"));
        assert_eq!(pool.pvs, vec!["/dev/sda2".to_owned()]);
        assert!(matches!(
            config.pool("Other"),
            Err(ConfigError::SectionNotFound(_))
        ));
    }

    #[test]
    fn unknown_section_type_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        write(&path, "[remote origin]\nurl = \"x\"\n");
        let config = Configuration::file(&path);
        assert!(matches!(
            config.sections(None),
            Err(ConfigError::UnknownSectionType(t)) if t == "remote"
        ));
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct RemoteSection {
        #[serde(skip)]
        name: String,
        url: String,
    }

    impl Section for RemoteSection {
        fn section_type(&self) -> &str {
            "remote"
        }
        fn name(&self) -> Option<&str> {
            Some(&self.name)
        }
        fn save(&self) -> Result<SectionValues, ConfigError> {
            to_values("remote", self)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn build_remote(name: Option<&str>, values: SectionValues) -> Result<Box<dyn Section>, ConfigError> {
        let mut remote: RemoteSection = from_values("remote", values)?;
        remote.name = name.unwrap_or_default().to_owned();
        Ok(Box::new(remote))
    }

    #[test]
    fn registered_section_types_are_built() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        write(&path, "[\"remote origin\"]\nurl = \"https://example.com\"\n");
        let mut config = Configuration::file(&path);
        config.registry_mut().register("remote", build_remote);
        assert!(config.registry_mut().is_registered("remote"));

        let section = config.section("remote", Some("origin")).unwrap();
        let remote = section.as_any().downcast_ref::<RemoteSection>().unwrap();
        assert_eq!(remote.url, "https://example.com");
    }

    #[test]
    fn save_and_remove_touch_only_user_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = layered(dir.path());
        let vendor = dir.path().join("vendor/stratum.toml");
        write(&vendor, "[core]\nvg = \"VendorVG\"\n");

        let core = CoreSection {
            mode: Some("11".to_owned()),
            ..CoreSection::default()
        };
        config.save(&core).unwrap();
        let written = fs::read_to_string(dir.path().join("etc/stratum.toml")).unwrap();
        assert!(written.contains("[core]"));
        assert!(written.contains("mode = \"11\""));

        let merged = config.core().unwrap();
        assert_eq!(merged.mode.as_deref(), Some("11"));
        assert_eq!(merged.vg.as_deref(), Some("VendorVG"));

        let mut pool = PoolSection::new("ImagePool");
        pool.size = Some("10G".to_owned());
        config.save(&pool).unwrap();
        assert_eq!(config.pool("ImagePool").unwrap().size.as_deref(), Some("10G"));

        assert!(config.remove(&core).unwrap());
        assert!(!config.remove(&core).unwrap());
        assert_eq!(config.core().unwrap().mode, None);
        assert_eq!(fs::read_to_string(&vendor).unwrap(), "[core]\nvg = \"VendorVG\"\n");
    }

    #[test]
    fn save_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        write(&path, "[core]\nvg = \"KeepVG\"\ncustom = 3\n");
        let config = Configuration::file(&path);

        let mut core = config.core().unwrap();
        assert_eq!(core.extra.get("custom"), Some(&toml::Value::Integer(3)));
        core.thinpool = Some("Pool2".to_owned());
        config.save(&core).unwrap();

        let core = config.core().unwrap();
        assert_eq!(core.vg.as_deref(), Some("KeepVG"));
        assert_eq!(core.thinpool.as_deref(), Some("Pool2"));
        assert!(core.extra.contains_key("custom"));
    }

    #[test]
    fn invalid_values_name_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        write(&path, "[core]\nvg = 5\n");
        let err = Configuration::file(&path).core().unwrap_err();
        assert!(err.to_string().contains("core"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        write(&path, "[core\n");
        let err = Configuration::file(&path).core().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn header_splitting() {
        assert_eq!(split_header("core"), ("core", None));
        assert_eq!(split_header("pool ImagePool"), ("pool", Some("ImagePool")));
    }
}
