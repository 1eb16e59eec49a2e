use crate::runner::CommandRunner;
use crate::HostError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

/// A filesystem mounted at a temporary target.
#[derive(Debug)]
pub struct MountPoint {
    pub device: String,
    pub target: PathBuf,
    dir: Option<TempDir>,
}

impl MountPoint {
    pub fn new(device: &str, target: PathBuf) -> Self {
        Self {
            device: device.to_owned(),
            target,
            dir: None,
        }
    }

    /// A mount point whose target directory is removed once it is unmounted.
    pub fn in_temp_dir(device: &str, dir: TempDir) -> Self {
        Self {
            device: device.to_owned(),
            target: dir.path().to_path_buf(),
            dir: Some(dir),
        }
    }

    /// Keep the target directory on disk. Used when unmounting failed, so the
    /// still-mounted filesystem is never removed recursively.
    fn leak_dir(&mut self) {
        if let Some(dir) = self.dir.take() {
            std::mem::forget(dir);
        }
    }
}

pub trait MountService: Send + Sync {
    fn mount(&self, device: &str) -> Result<MountPoint, HostError>;

    fn unmount(&self, point: MountPoint) -> Result<(), HostError>;

    /// The device mounted at `target` (e.g. the volume behind `/`).
    fn mount_source(&self, target: &Path) -> Result<String, HostError>;
}

/// Mount held for the lifetime of the guard.
///
/// `release` unmounts and reports failure; dropping the guard unmounts too
/// and only logs a warning, so an error on another path is not masked.
pub struct ScopedMount<'a> {
    service: &'a dyn MountService,
    point: Option<MountPoint>,
}

impl<'a> ScopedMount<'a> {
    pub fn new(service: &'a dyn MountService, device: &str) -> Result<Self, HostError> {
        let point = service.mount(device)?;
        debug!("mounted {device} at {}", point.target.display());
        Ok(Self {
            service,
            point: Some(point),
        })
    }

    pub fn target(&self) -> &Path {
        self.point
            .as_ref()
            .map_or_else(|| Path::new(""), |p| p.target.as_path())
    }

    pub fn release(mut self) -> Result<(), HostError> {
        match self.point.take() {
            Some(point) => self.service.unmount(point),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if let Some(point) = self.point.take() {
            let target = point.target.clone();
            if let Err(e) = self.service.unmount(point) {
                warn!("failed to unmount {}: {e}", target.display());
            }
        }
    }
}

pub struct SystemMountService {
    runner: Arc<dyn CommandRunner>,
}

impl SystemMountService {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl MountService for SystemMountService {
    fn mount(&self, device: &str) -> Result<MountPoint, HostError> {
        let dir = tempfile::Builder::new().prefix("stratum-mnt.").tempdir()?;
        let target = dir.path().to_string_lossy().into_owned();
        self.runner.run("mount", &[device, &target])?;
        Ok(MountPoint::in_temp_dir(device, dir))
    }

    fn unmount(&self, mut point: MountPoint) -> Result<(), HostError> {
        let target = point.target.to_string_lossy().into_owned();
        if let Err(e) = self.runner.run("umount", &[&target]) {
            point.leak_dir();
            return Err(e);
        }
        Ok(())
    }

    fn mount_source(&self, target: &Path) -> Result<String, HostError> {
        let target = target.to_string_lossy();
        let args = ["--noheadings", "-o", "SOURCE", &*target];
        let out = self.runner.run("findmnt", &args)?;
        let source = out.trim();
        if source.is_empty() {
            return Err(HostError::UnexpectedOutput {
                command: format!("findmnt {}", args.join(" ")),
                output: out.clone(),
            });
        }
        Ok(source.to_owned())
    }
}
