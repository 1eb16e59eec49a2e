//! In-memory collaborators for tests.
//!
//! Devices of the mock volume manager are plain files under a root
//! directory, so digests and fstab rewrites exercise real I/O. An inactive
//! volume keeps its content beside the device path, which then does not
//! exist, as on a real host. Every mock is
//! `Clone` and shares its state, so a test can hand one copy to the engine
//! and inspect the other.

use crate::boot::Bootloader;
use crate::lvm::{LogicalVolume, Permission, PoolUsage, VolumeAttributes, VolumeManager};
use crate::mount::{MountPoint, MountService};
use crate::size::Size;
use crate::HostError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct MockVolume {
    device: PathBuf,
    active: bool,
    activation_skip: bool,
    permission: Permission,
    origin: Option<String>,
    tags: Vec<String>,
}

impl MockVolume {
    fn data(&self) -> PathBuf {
        if self.active {
            self.device.clone()
        } else {
            parked(&self.device)
        }
    }
}

fn parked(device: &Path) -> PathBuf {
    let mut name = device.as_os_str().to_owned();
    name.push(".inactive");
    PathBuf::from(name)
}

#[derive(Debug, Default)]
struct MockLvm {
    groups: BTreeSet<String>,
    pools: BTreeMap<String, (Size, f64)>,
    volumes: BTreeMap<String, MockVolume>,
    journal: Vec<String>,
    failures: Vec<(String, Option<String>)>,
}

impl MockLvm {
    fn check(
        &mut self,
        op: &str,
        lv: Option<&LogicalVolume>,
        detail: &str,
    ) -> Result<(), HostError> {
        let target = lv.map(LogicalVolume::lvm_name);
        let entry = match &target {
            Some(name) if detail.is_empty() => format!("{op} {name}"),
            Some(name) => format!("{op} {name} {detail}"),
            None => format!("{op} {detail}"),
        };
        self.journal.push(entry.trim_end().to_owned());

        let injected = self.failures.iter().any(|(fail_op, fail_lv)| {
            fail_op == op && (fail_lv.is_none() || fail_lv.as_ref() == target.as_ref())
        });
        if injected {
            return Err(HostError::Injected(entry));
        }
        Ok(())
    }

    fn volume_mut(&mut self, lv: &LogicalVolume) -> Result<&mut MockVolume, HostError> {
        self.volumes
            .get_mut(&lv.lvm_name())
            .ok_or_else(|| HostError::UnknownVolume(lv.lvm_name()))
    }

    fn volume(&self, lv: &LogicalVolume) -> Result<&MockVolume, HostError> {
        self.volumes
            .get(&lv.lvm_name())
            .ok_or_else(|| HostError::UnknownVolume(lv.lvm_name()))
    }
}

fn already_exists(command: String) -> HostError {
    HostError::CommandFailed {
        command,
        status: "exit status: 5".to_owned(),
        stderr: "already exists".to_owned(),
    }
}

#[derive(Debug, Clone)]
pub struct MockVolumeManager {
    root: PathBuf,
    state: Arc<Mutex<MockLvm>>,
}

impl MockVolumeManager {
    /// Device files are created below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Arc::new(Mutex::new(MockLvm::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockLvm>, HostError> {
        self.state
            .lock()
            .map_err(|e| HostError::Poisoned(e.to_string()))
    }

    fn new_device(&self, lv: &LogicalVolume) -> Result<PathBuf, HostError> {
        let dir = self.root.join(&lv.vg);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(&lv.name))
    }

    /// A volume group with a thinpool, as left behind by `init`.
    pub fn with_pool(self, vg: &str, pool: &str, size: Size) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.groups.insert(vg.to_owned());
            state
                .pools
                .insert(LogicalVolume::new(vg, pool).lvm_name(), (size, 0.0));
        }
        self
    }

    /// Add an unmanaged, writable volume with `content`.
    pub fn add_foreign_volume(
        &self,
        vg: &str,
        name: &str,
        content: &[u8],
    ) -> Result<LogicalVolume, HostError> {
        let lv = LogicalVolume::new(vg, name);
        let device = self.new_device(&lv)?;
        fs::write(&device, content)?;
        let mut state = self.lock()?;
        state.groups.insert(vg.to_owned());
        state.volumes.insert(
            lv.lvm_name(),
            MockVolume {
                device,
                active: true,
                activation_skip: false,
                permission: Permission::ReadWrite,
                origin: None,
                tags: Vec::new(),
            },
        );
        Ok(lv)
    }

    pub fn set_pool_usage(&self, vg: &str, pool: &str, used_percent: f64) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.pools.get_mut(&LogicalVolume::new(vg, pool).lvm_name()) {
                entry.1 = used_percent;
            }
        }
    }

    /// Make `op` fail, for every volume or only for `lvm_name`.
    pub fn fail_on(&self, op: &str, lvm_name: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .failures
                .push((op.to_owned(), lvm_name.map(str::to_owned)));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.clear();
        }
    }

    /// Every call made so far, e.g. `set_activation_skip HostVG/Image-0.1 y`.
    pub fn journal(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.journal.clone())
            .unwrap_or_default()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The file holding a volume's content, active or not.
    pub fn device_file(&self, lvm_name: &str) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.volumes.get(lvm_name).map(MockVolume::data))
    }
}

fn unit_factor(units: &str) -> Option<f64> {
    let shift = match units {
        "b" | "B" => 0,
        "s" | "S" => return Some(512.0),
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        _ => return None,
    };
    Some((1u64 << shift) as f64)
}

impl VolumeManager for MockVolumeManager {
    fn list_volumes(&self, vg: &str) -> Result<Vec<String>, HostError> {
        let state = self.lock()?;
        if !state.groups.contains(vg) {
            return Err(HostError::UnknownVolume(vg.to_owned()));
        }
        let prefix = format!("{vg}/");
        Ok(state
            .volumes
            .keys()
            .chain(state.pools.keys())
            .filter_map(|name| name.strip_prefix(&prefix))
            .map(str::to_owned)
            .collect())
    }

    fn create_volume_group(&self, vg: &str, pvs: &[String]) -> Result<(), HostError> {
        let mut state = self.lock()?;
        state.check("create_volume_group", None, &format!("{vg} {}", pvs.join(" ")))?;
        if !state.groups.insert(vg.to_owned()) {
            return Err(already_exists(format!("vgcreate {vg}")));
        }
        Ok(())
    }

    fn create_thin_pool(
        &self,
        vg: &str,
        pool: &str,
        size: Size,
    ) -> Result<LogicalVolume, HostError> {
        let lv = LogicalVolume::new(vg, pool);
        let mut state = self.lock()?;
        state.check("create_thin_pool", Some(&lv), &size.to_string())?;
        if !state.groups.contains(vg) {
            return Err(HostError::UnknownVolume(vg.to_owned()));
        }
        if state.pools.contains_key(&lv.lvm_name()) {
            return Err(already_exists(format!("lvcreate --thin {lv}")));
        }
        state.pools.insert(lv.lvm_name(), (size, 0.0));
        Ok(lv)
    }

    fn create_thin_volume(
        &self,
        vg: &str,
        pool: &str,
        name: &str,
        size: Size,
    ) -> Result<LogicalVolume, HostError> {
        let lv = LogicalVolume::new(vg, name);
        let mut state = self.lock()?;
        state.check("create_thin_volume", Some(&lv), &size.to_string())?;
        if !state.pools.contains_key(&LogicalVolume::new(vg, pool).lvm_name()) {
            return Err(HostError::UnknownVolume(format!("{vg}/{pool}")));
        }
        if state.volumes.contains_key(&lv.lvm_name()) {
            return Err(already_exists(format!("lvcreate --thin --name {name}")));
        }
        let device = self.new_device(&lv)?;
        fs::write(&device, b"")?;
        state.volumes.insert(
            lv.lvm_name(),
            MockVolume {
                device,
                active: true,
                activation_skip: false,
                permission: Permission::ReadWrite,
                origin: None,
                tags: Vec::new(),
            },
        );
        Ok(lv)
    }

    fn create_snapshot(
        &self,
        origin: &LogicalVolume,
        name: &str,
    ) -> Result<LogicalVolume, HostError> {
        let lv = LogicalVolume::new(&origin.vg, name);
        let mut state = self.lock()?;
        state.check("create_snapshot", Some(origin), name)?;
        let source = state.volume(origin)?.data();
        if state.volumes.contains_key(&lv.lvm_name()) {
            return Err(already_exists(format!("lvcreate --snapshot --name {name}")));
        }
        let device = self.new_device(&lv)?;
        fs::copy(&source, parked(&device))?;
        // thin snapshots start inactive and flagged to skip activation
        state.volumes.insert(
            lv.lvm_name(),
            MockVolume {
                device,
                active: false,
                activation_skip: true,
                permission: Permission::ReadWrite,
                origin: Some(origin.name.clone()),
                tags: Vec::new(),
            },
        );
        Ok(lv)
    }

    fn set_activation(
        &self,
        lv: &LogicalVolume,
        active: bool,
        ignore_skip: bool,
    ) -> Result<(), HostError> {
        let mut state = self.lock()?;
        let detail = format!(
            "{}{}",
            if active { "y" } else { "n" },
            if ignore_skip { " K" } else { "" }
        );
        state.check("set_activation", Some(lv), &detail)?;
        let volume = state.volume_mut(lv)?;
        if active && volume.activation_skip && !ignore_skip {
            return Ok(());
        }
        if volume.active != active {
            let target = if active {
                volume.device.clone()
            } else {
                parked(&volume.device)
            };
            fs::rename(volume.data(), target)?;
            volume.active = active;
        }
        Ok(())
    }

    fn set_activation_skip(&self, lv: &LogicalVolume, skip: bool) -> Result<(), HostError> {
        let mut state = self.lock()?;
        state.check("set_activation_skip", Some(lv), if skip { "y" } else { "n" })?;
        state.volume_mut(lv)?.activation_skip = skip;
        Ok(())
    }

    fn set_permission(&self, lv: &LogicalVolume, permission: Permission) -> Result<(), HostError> {
        let mut state = self.lock()?;
        state.check("set_permission", Some(lv), permission.as_lvm_arg())?;
        state.volume_mut(lv)?.permission = permission;
        Ok(())
    }

    fn add_tag(&self, lv: &LogicalVolume, tag: &str) -> Result<(), HostError> {
        let mut state = self.lock()?;
        state.check("add_tag", Some(lv), tag)?;
        let volume = state.volume_mut(lv)?;
        if !volume.tags.iter().any(|t| t == tag) {
            volume.tags.push(tag.to_owned());
        }
        Ok(())
    }

    fn tags(&self, lv: &LogicalVolume) -> Result<Vec<String>, HostError> {
        Ok(self.lock()?.volume(lv)?.tags.clone())
    }

    fn find_by_tag(&self, tag: &str) -> Result<Vec<LogicalVolume>, HostError> {
        let state = self.lock()?;
        state
            .volumes
            .iter()
            .filter(|(_, v)| v.tags.iter().any(|t| t == tag))
            .map(|(name, _)| LogicalVolume::from_lvm_name(name))
            .collect()
    }

    fn origin(&self, lv: &LogicalVolume) -> Result<Option<LogicalVolume>, HostError> {
        let state = self.lock()?;
        Ok(state
            .volume(lv)?
            .origin
            .as_deref()
            .map(|name| LogicalVolume::new(&lv.vg, name)))
    }

    fn attributes(&self, lv: &LogicalVolume) -> Result<VolumeAttributes, HostError> {
        let state = self.lock()?;
        let volume = state.volume(lv)?;
        Ok(VolumeAttributes {
            active: volume.active,
            activation_skip: volume.activation_skip,
            permission: volume.permission,
            origin: volume.origin.clone(),
        })
    }

    fn pool_usage(&self, vg: &str, pool: &str, units: &str) -> Result<PoolUsage, HostError> {
        let state = self.lock()?;
        let name = LogicalVolume::new(vg, pool).lvm_name();
        let (size, used_percent) = state
            .pools
            .get(&name)
            .copied()
            .ok_or(HostError::UnknownVolume(name))?;
        let factor = unit_factor(units).ok_or_else(|| HostError::InvalidSize(units.to_owned()))?;
        Ok(PoolUsage {
            used_percent,
            size: size.bytes() as f64 / factor,
        })
    }

    fn device_path(&self, lv: &LogicalVolume) -> Result<String, HostError> {
        Ok(self
            .lock()?
            .volume(lv)?
            .device
            .to_string_lossy()
            .into_owned())
    }

    fn resolve_device(&self, path: &str) -> Result<LogicalVolume, HostError> {
        let state = self.lock()?;
        let found = state
            .volumes
            .iter()
            .find(|(_, v)| v.device == Path::new(path))
            .map(|(name, _)| name.clone());
        match found {
            Some(name) => LogicalVolume::from_lvm_name(&name),
            None => Err(HostError::UnknownVolume(path.to_owned())),
        }
    }
}

#[derive(Debug, Default)]
struct BootEntries {
    entries: Vec<(String, String)>,
    fail: bool,
}

/// Records boot entries instead of writing them.
#[derive(Debug, Clone, Default)]
pub struct MockBootloader {
    state: Arc<Mutex<BootEntries>>,
}

impl MockBootloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(title, device)` pairs in the order they were added.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    pub fn fail(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail = true;
        }
    }
}

impl Bootloader for MockBootloader {
    fn add_boot_entry(&self, title: &str, device: &str) -> Result<(), HostError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| HostError::Poisoned(e.to_string()))?;
        if state.fail {
            return Err(HostError::Injected(format!("add_boot_entry {title}")));
        }
        state.entries.push((title.to_owned(), device.to_owned()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Mounts {
    counter: usize,
    active: Vec<PathBuf>,
    history: Vec<(String, PathBuf)>,
    sources: HashMap<PathBuf, String>,
    fstab: Option<String>,
    fail_unmount: bool,
}

/// Mounts are directories under a root; every new one is seeded with
/// `etc/fstab` when a seed was set.
#[derive(Debug, Clone)]
pub struct MockMountService {
    root: PathBuf,
    state: Arc<Mutex<Mounts>>,
}

impl MockMountService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Arc::new(Mutex::new(Mounts::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Mounts>, HostError> {
        self.state
            .lock()
            .map_err(|e| HostError::Poisoned(e.to_string()))
    }

    pub fn seed_fstab(&self, content: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fstab = Some(content.to_owned());
        }
    }

    pub fn set_mount_source(&self, target: impl Into<PathBuf>, device: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.sources.insert(target.into(), device.to_owned());
        }
    }

    pub fn fail_unmount(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_unmount = true;
        }
    }

    /// Targets currently mounted.
    pub fn active(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .map(|s| s.active.clone())
            .unwrap_or_default()
    }

    /// Every `(device, target)` ever mounted.
    pub fn history(&self) -> Vec<(String, PathBuf)> {
        self.state
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }
}

impl MountService for MockMountService {
    fn mount(&self, device: &str) -> Result<MountPoint, HostError> {
        let mut state = self.lock()?;
        state.counter += 1;
        let target = self.root.join(format!("mnt-{}", state.counter));
        fs::create_dir_all(target.join("etc"))?;
        if let Some(fstab) = &state.fstab {
            fs::write(target.join("etc/fstab"), fstab)?;
        }
        state.active.push(target.clone());
        state.history.push((device.to_owned(), target.clone()));
        Ok(MountPoint::new(device, target))
    }

    fn unmount(&self, point: MountPoint) -> Result<(), HostError> {
        let mut state = self.lock()?;
        if state.fail_unmount {
            return Err(HostError::Injected(format!(
                "unmount {}",
                point.target.display()
            )));
        }
        state.active.retain(|t| *t != point.target);
        Ok(())
    }

    fn mount_source(&self, target: &Path) -> Result<String, HostError> {
        self.lock()?
            .sources
            .get(target)
            .cloned()
            .ok_or_else(|| HostError::UnexpectedOutput {
                command: format!("findmnt --noheadings -o SOURCE {}", target.display()),
                output: String::new(),
            })
    }
}
