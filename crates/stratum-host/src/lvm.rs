use crate::runner::CommandRunner;
use crate::size::Size;
use crate::HostError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use stratum_schema::Image;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogicalVolume {
    pub vg: String,
    pub name: String,
}

impl LogicalVolume {
    pub fn new(vg: &str, name: &str) -> Self {
        Self {
            vg: vg.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Parse the `VG/LV` form.
    pub fn from_lvm_name(lvm_name: &str) -> Result<Self, HostError> {
        match lvm_name.trim().split_once('/') {
            Some((vg, lv)) if !vg.is_empty() && !lv.is_empty() && !lv.contains('/') => {
                Ok(Self::new(vg, lv))
            }
            _ => Err(HostError::InvalidLvmName(lvm_name.to_owned())),
        }
    }

    pub fn lvm_name(&self) -> String {
        format!("{}/{}", self.vg, self.name)
    }
}

impl fmt::Display for LogicalVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vg, self.name)
    }
}

impl From<&Image> for LogicalVolume {
    fn from(image: &Image) -> Self {
        Self::new(&image.vg, &image.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn as_lvm_arg(self) -> &'static str {
        match self {
            Permission::ReadOnly => "r",
            Permission::ReadWrite => "rw",
        }
    }
}

/// Live attributes of one volume, as LVM reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeAttributes {
    pub active: bool,
    pub activation_skip: bool,
    pub permission: Permission,
    pub origin: Option<String>,
}

impl VolumeAttributes {
    /// Decode the ten character `lv_attr` field.
    ///
    /// Position 2 is the permission (`w`, `r` or `R`), position 5 the state
    /// (`a` when active) and position 10 is `k` when activation is skipped.
    pub fn from_lv_attr(attr: &str, origin: Option<String>) -> Option<Self> {
        let chars: Vec<char> = attr.trim().chars().collect();
        if chars.len() < 10 {
            return None;
        }
        Some(Self {
            permission: if chars[1] == 'w' {
                Permission::ReadWrite
            } else {
                Permission::ReadOnly
            },
            active: chars[4] == 'a',
            activation_skip: chars[9] == 'k',
            origin,
        })
    }
}

/// Thinpool data usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolUsage {
    pub used_percent: f64,
    pub size: f64,
}

impl PoolUsage {
    pub fn free(&self) -> f64 {
        self.size - self.size * self.used_percent / 100.0
    }

    /// Parse `lvs -o data_percent,lv_size` output. Decimal commas are accepted.
    pub fn parse(output: &str) -> Option<Self> {
        let normalized = output.replace(',', ".");
        let mut fields = normalized.split_whitespace();
        let used_percent = fields.next()?.parse().ok()?;
        let size = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self { used_percent, size })
    }
}

/// Block volume operations the engine needs. Nothing here deletes a volume.
pub trait VolumeManager: Send + Sync {
    /// Names of all volumes in `vg`, in no particular order.
    fn list_volumes(&self, vg: &str) -> Result<Vec<String>, HostError>;

    fn create_volume_group(&self, vg: &str, pvs: &[String]) -> Result<(), HostError>;

    fn create_thin_pool(&self, vg: &str, pool: &str, size: Size)
        -> Result<LogicalVolume, HostError>;

    fn create_thin_volume(
        &self,
        vg: &str,
        pool: &str,
        name: &str,
        size: Size,
    ) -> Result<LogicalVolume, HostError>;

    /// Snapshots start flagged to skip activation, whatever `lvm.conf` says.
    fn create_snapshot(
        &self,
        origin: &LogicalVolume,
        name: &str,
    ) -> Result<LogicalVolume, HostError>;

    fn set_activation(
        &self,
        lv: &LogicalVolume,
        active: bool,
        ignore_skip: bool,
    ) -> Result<(), HostError>;

    fn set_activation_skip(&self, lv: &LogicalVolume, skip: bool) -> Result<(), HostError>;

    fn set_permission(&self, lv: &LogicalVolume, permission: Permission) -> Result<(), HostError>;

    fn add_tag(&self, lv: &LogicalVolume, tag: &str) -> Result<(), HostError>;

    fn tags(&self, lv: &LogicalVolume) -> Result<Vec<String>, HostError>;

    fn find_by_tag(&self, tag: &str) -> Result<Vec<LogicalVolume>, HostError>;

    /// Copy-on-write parent of `lv`, if it is a snapshot.
    fn origin(&self, lv: &LogicalVolume) -> Result<Option<LogicalVolume>, HostError>;

    fn attributes(&self, lv: &LogicalVolume) -> Result<VolumeAttributes, HostError>;

    fn pool_usage(&self, vg: &str, pool: &str, units: &str) -> Result<PoolUsage, HostError>;

    fn device_path(&self, lv: &LogicalVolume) -> Result<String, HostError>;

    /// The volume behind a block device path.
    fn resolve_device(&self, path: &str) -> Result<LogicalVolume, HostError>;
}

fn yn(value: bool) -> &'static str {
    if value {
        "y"
    } else {
        "n"
    }
}

/// `VolumeManager` backed by the LVM command line tools.
pub struct LvmVolumeManager {
    runner: Arc<dyn CommandRunner>,
}

impl LvmVolumeManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn lvs(&self, args: &[&str]) -> Result<String, HostError> {
        self.runner.run("lvs", args)
    }

    fn lvchange(&self, args: &[&str]) -> Result<(), HostError> {
        self.runner.run("lvchange", args).map(drop)
    }

    fn lvcreate(&self, args: &[&str]) -> Result<(), HostError> {
        self.runner.run("lvcreate", args).map(drop)
    }
}

impl VolumeManager for LvmVolumeManager {
    fn list_volumes(&self, vg: &str) -> Result<Vec<String>, HostError> {
        let out = self.lvs(&["--noheadings", "-o", "lv_name", vg])?;
        let names: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        debug!("found {} volumes in {vg}", names.len());
        Ok(names)
    }

    fn create_volume_group(&self, vg: &str, pvs: &[String]) -> Result<(), HostError> {
        let mut args = vec![vg];
        args.extend(pvs.iter().map(String::as_str));
        self.runner.run("vgcreate", &args).map(drop)
    }

    fn create_thin_pool(
        &self,
        vg: &str,
        pool: &str,
        size: Size,
    ) -> Result<LogicalVolume, HostError> {
        let lv = LogicalVolume::new(vg, pool);
        self.lvcreate(&["--thin", "--size", &size.to_lvm_arg(), &lv.lvm_name()])?;
        Ok(lv)
    }

    fn create_thin_volume(
        &self,
        vg: &str,
        pool: &str,
        name: &str,
        size: Size,
    ) -> Result<LogicalVolume, HostError> {
        let pool = LogicalVolume::new(vg, pool);
        self.lvcreate(&[
            "--thin",
            "--virtualsize",
            &size.to_lvm_arg(),
            "--name",
            name,
            &pool.lvm_name(),
        ])?;
        Ok(LogicalVolume::new(vg, name))
    }

    fn create_snapshot(
        &self,
        origin: &LogicalVolume,
        name: &str,
    ) -> Result<LogicalVolume, HostError> {
        self.lvcreate(&[
            "--snapshot",
            "--setactivationskip",
            "y",
            "--name",
            name,
            &origin.lvm_name(),
        ])?;
        Ok(LogicalVolume::new(&origin.vg, name))
    }

    fn set_activation(
        &self,
        lv: &LogicalVolume,
        active: bool,
        ignore_skip: bool,
    ) -> Result<(), HostError> {
        let name = lv.lvm_name();
        let mut args = vec!["--activate", yn(active), name.as_str()];
        if ignore_skip {
            args.push("--ignoreactivationskip");
        }
        self.lvchange(&args)
    }

    fn set_activation_skip(&self, lv: &LogicalVolume, skip: bool) -> Result<(), HostError> {
        self.lvchange(&["--setactivationskip", yn(skip), &lv.lvm_name()])
    }

    fn set_permission(&self, lv: &LogicalVolume, permission: Permission) -> Result<(), HostError> {
        self.lvchange(&["--permission", permission.as_lvm_arg(), &lv.lvm_name()])
    }

    fn add_tag(&self, lv: &LogicalVolume, tag: &str) -> Result<(), HostError> {
        self.lvchange(&["--addtag", tag, &lv.lvm_name()])
    }

    fn tags(&self, lv: &LogicalVolume) -> Result<Vec<String>, HostError> {
        let out = self.lvs(&["--noheadings", "-o", "lv_tags", &lv.lvm_name()])?;
        Ok(out
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn find_by_tag(&self, tag: &str) -> Result<Vec<LogicalVolume>, HostError> {
        let selector = format!("@{tag}");
        let out = self.lvs(&["--noheadings", "-o", "lv_full_name", &selector])?;
        out.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(LogicalVolume::from_lvm_name)
            .collect()
    }

    fn origin(&self, lv: &LogicalVolume) -> Result<Option<LogicalVolume>, HostError> {
        let out = self.lvs(&["--noheadings", "-o", "origin", &lv.lvm_name()])?;
        let name = out.trim();
        Ok((!name.is_empty()).then(|| LogicalVolume::new(&lv.vg, name)))
    }

    fn attributes(&self, lv: &LogicalVolume) -> Result<VolumeAttributes, HostError> {
        let name = lv.lvm_name();
        let args = [
            "--noheadings",
            "--separator",
            "$",
            "-o",
            "lv_attr,origin",
            name.as_str(),
        ];
        let out = self.lvs(&args)?;
        let (attr, origin) = out.trim().split_once('$').unwrap_or((out.trim(), ""));
        let origin = Some(origin.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_owned);
        VolumeAttributes::from_lv_attr(attr, origin).ok_or_else(|| HostError::UnexpectedOutput {
            command: format!("lvs {}", args.join(" ")),
            output: out.clone(),
        })
    }

    fn pool_usage(&self, vg: &str, pool: &str, units: &str) -> Result<PoolUsage, HostError> {
        let name = LogicalVolume::new(vg, pool).lvm_name();
        let args = [
            "--noheadings",
            "--nosuffix",
            "--units",
            units,
            "--options",
            "data_percent,lv_size",
            name.as_str(),
        ];
        let out = self.lvs(&args)?;
        PoolUsage::parse(&out).ok_or_else(|| HostError::UnexpectedOutput {
            command: format!("lvs {}", args.join(" ")),
            output: out,
        })
    }

    fn device_path(&self, lv: &LogicalVolume) -> Result<String, HostError> {
        let out = self.lvs(&["--noheadings", "-o", "lv_path", &lv.lvm_name()])?;
        let path = out.trim();
        if path.is_empty() {
            if self.runner.is_dry() {
                return Ok(format!("/dev/{}/{}", lv.vg, lv.name));
            }
            return Err(HostError::UnknownVolume(lv.lvm_name()));
        }
        Ok(path.to_owned())
    }

    fn resolve_device(&self, path: &str) -> Result<LogicalVolume, HostError> {
        let out = self.lvs(&["--noheadings", "-o", "vg_name,lv_name", path])?;
        let fields: Vec<&str> = out.split_whitespace().collect();
        match fields.as_slice() {
            [vg, lv] => Ok(LogicalVolume::new(vg, lv)),
            _ => Err(HostError::UnknownVolume(path.to_owned())),
        }
    }
}
