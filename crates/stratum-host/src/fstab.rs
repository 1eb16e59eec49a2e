use crate::HostError;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// An `/etc/fstab` kept line by line, so rewriting one entry leaves every
/// other line (comments and spacing included) as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fstab {
    lines: Vec<String>,
    trailing_newline: bool,
}

fn is_entry(line: &str) -> bool {
    let line = line.trim_start();
    !line.is_empty() && !line.starts_with('#')
}

impl Fstab {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_owned).collect(),
            trailing_newline: content.ends_with('\n'),
        }
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    fn root_index(&self) -> Option<usize> {
        self.lines.iter().position(|line| {
            is_entry(line) && line.split_whitespace().nth(1) == Some("/")
        })
    }

    pub fn root_source(&self) -> Option<&str> {
        self.root_index()
            .and_then(|idx| self.lines[idx].split_whitespace().next())
    }

    /// Replace the source field of the `/` entry. Returns false if there is none.
    pub fn set_root_source(&mut self, source: &str) -> bool {
        let Some(idx) = self.root_index() else {
            return false;
        };
        let line = &self.lines[idx];
        let indent = line.len() - line.trim_start().len();
        let rest = line.trim_start();
        let field_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        self.lines[idx] = format!("{}{source}{}", &line[..indent], &rest[field_end..]);
        true
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), HostError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| HostError::Io(e.error))?;
        Ok(())
    }

    /// Point the root entry of the fstab at `path` to `source`.
    ///
    /// Returns whether a root entry was found. Nothing is written in dry mode.
    pub fn rewrite_root(path: &Path, source: &str, dry: bool) -> Result<bool, HostError> {
        if dry {
            debug!("dry run: would point / in {} at {source}", path.display());
            return Ok(true);
        }
        let mut fstab = Self::load(path)?;
        if !fstab.set_root_source(source) {
            warn!("no root entry in {}, leaving it untouched", path.display());
            return Ok(false);
        }
        fstab.save(path)?;
        debug!("pointed / in {} at {source}", path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# /etc/fstab
/dev/HostVG/Image-0.0 / ext4 defaults 1 1
UUID=abcd /boot ext4 defaults 1 2
# / commented root
/dev/HostVG/swap swap swap defaults 0 0
";

    #[test]
    fn finds_root_entry() {
        let fstab = Fstab::parse(SAMPLE);
        assert_eq!(fstab.root_source(), Some("/dev/HostVG/Image-0.0"));
    }

    #[test]
    fn rewrites_only_root_source() {
        let mut fstab = Fstab::parse(SAMPLE);
        assert!(fstab.set_root_source("/dev/HostVG/Image-0.1"));
        let expected = SAMPLE.replace(
            "/dev/HostVG/Image-0.0 / ext4",
            "/dev/HostVG/Image-0.1 / ext4",
        );
        assert_eq!(fstab.render(), expected);
    }

    #[test]
    fn keeps_tabs_and_indentation() {
        let mut fstab = Fstab::parse("  /dev/old\t/\txfs\tdefaults\t0 0");
        assert!(fstab.set_root_source("/dev/new"));
        assert_eq!(fstab.render(), "  /dev/new\t/\txfs\tdefaults\t0 0");
    }

    #[test]
    fn missing_root_entry() {
        let mut fstab = Fstab::parse("UUID=abcd /boot ext4 defaults 1 2\n");
        assert_eq!(fstab.root_source(), None);
        assert!(!fstab.set_root_source("/dev/x"));
    }

    #[test]
    fn rewrite_root_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        fs::write(&path, SAMPLE).unwrap();

        assert!(Fstab::rewrite_root(&path, "/dev/HostVG/Image-0.1", true).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);

        assert!(Fstab::rewrite_root(&path, "/dev/HostVG/Image-0.1", false).unwrap());
        let loaded = Fstab::load(&path).unwrap();
        assert_eq!(loaded.root_source(), Some("/dev/HostVG/Image-0.1"));
    }
}
