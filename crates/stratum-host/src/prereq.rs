use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
pub fn is_root() -> bool {
    // SAFETY: geteuid() takes no arguments, has no side effects and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

const TOOLS: [(&str, &str, &str); 6] = [
    ("lvs", "listing logical volumes", "part of lvm2"),
    ("lvcreate", "creating bases, layers and thinpools", "part of lvm2"),
    ("lvchange", "activation, permissions and tags", "part of lvm2"),
    ("tune2fs", "giving each layer a fresh filesystem identity", "part of e2fsprogs"),
    ("findmnt", "finding the volume behind /", "part of util-linux"),
    ("mount", "updating the fstab of a new layer", "part of util-linux"),
];

/// Check everything a mutating command needs on the host.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !is_root() {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "changing logical volumes and boot entries",
            install_hint: "run as root, or use --dry to preview",
        });
    }

    for (name, purpose, install_hint) in TOOLS {
        if !command_exists(name) {
            missing.push(MissingPrereq {
                name,
                purpose,
                install_hint,
            });
        }
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nStratum needs these to manage bases and layers.");
    msg
}
