//! Host integration for Stratum.
//!
//! The engine never talks to the operating system directly. Everything it
//! needs from the host goes through four collaborator traits defined here:
//! `VolumeManager` (LVM), `Bootloader` (BLS entries), `MountService` and
//! `CommandRunner`. Each has a system implementation that shells out to the
//! usual tools and an in-memory mock used by the tests. Dry-run mode is a
//! property of the command runner and is honored by every system
//! implementation.

pub mod boot;
pub mod digest;
pub mod fstab;
pub mod lvm;
pub mod mock;
pub mod mount;
pub mod prereq;
pub mod runner;
pub mod size;

pub use boot::{BlsBootloader, Bootloader, DEFAULT_ENTRIES_DIR};
pub use digest::digest_device;
pub use fstab::Fstab;
pub use lvm::{
    LogicalVolume, LvmVolumeManager, Permission, PoolUsage, VolumeAttributes, VolumeManager,
};
pub use mock::{MockBootloader, MockMountService, MockVolumeManager};
pub use mount::{MountPoint, MountService, ScopedMount, SystemMountService};
pub use prereq::{check_prereqs, format_missing, is_root, MissingPrereq};
pub use runner::{CommandRunner, RecordingRunner, SystemCommandRunner};
pub use size::Size;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to execute '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected output from '{command}': '{output}'")]
    UnexpectedOutput { command: String, output: String },
    #[error("unknown volume: {0}")]
    UnknownVolume(String),
    #[error("invalid volume name '{0}', expected '<vg>/<lv>'")]
    InvalidLvmName(String),
    #[error("invalid size '{0}', expected <number>[bBkKmMgGtT]")]
    InvalidSize(String),
    #[error("injected failure in {0}")]
    Injected(String),
    #[error("host state lock poisoned: {0}")]
    Poisoned(String),
}

/// The collaborators the engine drives, bundled.
pub struct Host {
    pub runner: Arc<dyn CommandRunner>,
    pub volumes: Box<dyn VolumeManager>,
    pub bootloader: Box<dyn Bootloader>,
    pub mounts: Box<dyn MountService>,
}

impl Host {
    /// LVM, BLS entries under `entries_dir`, and real mounts.
    pub fn system(dry: bool, entries_dir: impl Into<PathBuf>) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(dry));
        Self {
            volumes: Box::new(LvmVolumeManager::new(Arc::clone(&runner))),
            bootloader: Box::new(BlsBootloader::new(entries_dir, dry)),
            mounts: Box::new(SystemMountService::new(Arc::clone(&runner))),
            runner,
        }
    }

    pub fn is_dry(&self) -> bool {
        self.runner.is_dry()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("dry", &self.runner.is_dry())
            .finish_non_exhaustive()
    }
}
