use crate::HostError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const DEFAULT_ENTRIES_DIR: &str = "/boot/loader/entries";

pub trait Bootloader: Send + Sync {
    /// Make `device` bootable under `title` (the `VG/LV` name of the layer).
    fn add_boot_entry(&self, title: &str, device: &str) -> Result<(), HostError>;
}

/// Writes Boot Loader Specification entries.
///
/// Kernel and initrd lines are taken from the most recently modified entry
/// already present, since layers share the kernel of their base.
#[derive(Debug, Clone)]
pub struct BlsBootloader {
    entries_dir: PathBuf,
    dry: bool,
}

impl BlsBootloader {
    pub fn new(entries_dir: impl Into<PathBuf>, dry: bool) -> Self {
        Self {
            entries_dir: entries_dir.into(),
            dry,
        }
    }

    pub fn entry_path(&self, title: &str) -> PathBuf {
        self.entries_dir
            .join(format!("stratum-{}.conf", title.replace('/', "-")))
    }

    fn newest_entry(&self) -> Result<Option<PathBuf>, HostError> {
        let entries = match fs::read_dir(&self.entries_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "conf") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, p)| p))
    }

    fn render_entry(&self, title: &str, device: &str) -> Result<String, HostError> {
        let mut kernel_lines = Vec::new();
        if let Some(template) = self.newest_entry()? {
            debug!("using {} as boot entry template", template.display());
            for line in fs::read_to_string(&template)?.lines() {
                let key = line.split_whitespace().next();
                if matches!(key, Some("linux" | "initrd")) {
                    kernel_lines.push(line.trim().to_owned());
                }
            }
        }
        if kernel_lines.is_empty() {
            warn!(
                "no kernel found in {}, entry for {title} has no linux line",
                self.entries_dir.display()
            );
        }

        let mut entry = format!("title {title}\n");
        for line in kernel_lines {
            entry.push_str(&line);
            entry.push('\n');
        }
        entry.push_str(&format!("options root={device} rd.lvm.lv={title} rw\n"));
        Ok(entry)
    }
}

impl Bootloader for BlsBootloader {
    fn add_boot_entry(&self, title: &str, device: &str) -> Result<(), HostError> {
        let path = self.entry_path(title);
        let entry = self.render_entry(title, device)?;
        if self.dry {
            info!("dry run: would write boot entry {}", path.display());
            return Ok(());
        }
        fs::create_dir_all(&self.entries_dir)?;
        write_atomic(&self.entries_dir, &path, &entry)?;
        info!("added boot entry {}", path.display());
        Ok(())
    }
}

fn write_atomic(dir: &Path, dest: &Path, content: &str) -> Result<(), HostError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| HostError::Io(e.error))?;
    Ok(())
}
