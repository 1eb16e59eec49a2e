pub mod base;
pub mod completions;
pub mod config;
pub mod free_space;
pub mod init;
pub mod inspect;
pub mod layer;
pub mod layout;
pub mod man_pages;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use stratum_core::{Engine, HostLock, DEFAULT_LOCK_PATH};
use stratum_schema::Image;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_HOST_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` under a spinner unless JSON output was requested.
pub fn with_spinner<T, E: ToString>(
    json: bool,
    msg: &str,
    done: &str,
    failed: &str,
    op: impl FnOnce() -> Result<T, E>,
) -> Result<T, String> {
    let pb = if json { None } else { Some(spinner(msg)) };
    match op() {
        Ok(value) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, done);
            }
            Ok(value)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, failed);
            }
            Err(e.to_string())
        }
    }
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "base-locked" => Style::new().green().apply_to(state).to_string(),
        "activated" => Style::new().cyan().bold().apply_to(state).to_string(),
        "base-created" | "snapshotting" => Style::new().yellow().apply_to(state).to_string(),
        "superseded" | "absent" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

pub fn colorize_integrity(status: &str) -> String {
    use console::Style;
    if status == "intact" {
        Style::new().green().apply_to(status).to_string()
    } else {
        Style::new().red().bold().apply_to(status).to_string()
    }
}

pub fn print_images(images: &[Image], json: bool) -> Result<(), String> {
    if json {
        println!("{}", json_pretty(&images)?);
    } else {
        for image in images {
            println!("{image}");
        }
    }
    Ok(())
}

pub fn print_image(image: &Image, json: bool) -> Result<(), String> {
    if json {
        println!("{}", json_pretty(image)?);
    } else {
        println!("{image}");
    }
    Ok(())
}

/// Serialize mutating commands. Dry runs change nothing and take no lock.
pub fn host_lock(engine: &Engine) -> Result<Option<HostLock>, String> {
    if engine.is_dry() {
        return Ok(None);
    }
    let path = std::env::var_os("STRATUM_LOCK_FILE")
        .map_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH), PathBuf::from);
    match HostLock::try_acquire(&path) {
        Ok(Some(lock)) => Ok(Some(lock)),
        Ok(None) => Err(format!(
            "host lock: another stratum command holds {}",
            path.display()
        )),
        Err(e) => Err(format!("host lock: {e}")),
    }
}
