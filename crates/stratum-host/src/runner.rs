use crate::HostError;
use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Executes external programs and returns their trimmed stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, HostError>;

    /// In dry mode nothing is executed and every call returns empty output.
    fn is_dry(&self) -> bool;
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[derive(Debug, Default)]
pub struct SystemCommandRunner {
    dry: bool,
}

impl SystemCommandRunner {
    pub fn new(dry: bool) -> Self {
        Self { dry }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, HostError> {
        let line = command_line(program, args);
        if self.dry {
            info!("dry run: {line}");
            return Ok(String::new());
        }
        debug!("running: {line}");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| HostError::Spawn {
                command: line.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(HostError::CommandFailed {
                command: line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        debug!("returned: {}", stdout.chars().take(1024).collect::<String>());
        Ok(stdout)
    }

    fn is_dry(&self) -> bool {
        self.dry
    }
}

#[derive(Debug, Default)]
struct Recording {
    calls: Vec<String>,
    outputs: HashMap<String, String>,
    failures: Vec<String>,
}

/// Mock runner: records every command line and answers from canned outputs.
///
/// Outputs are matched on the full command line first, then on the program
/// name alone. Unmatched commands succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    dry: bool,
    state: Arc<Mutex<Recording>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry() -> Self {
        Self {
            dry: true,
            ..Self::default()
        }
    }

    /// Answer `command` (a full command line or a bare program name) with `output`.
    pub fn respond(&self, command: &str, output: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.outputs.insert(command.to_owned(), output.to_owned());
        }
    }

    /// Make `command` (full line or program name) exit unsuccessfully.
    pub fn fail(&self, command: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(command.to_owned());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, HostError> {
        let line = command_line(program, args);
        let mut state = self
            .state
            .lock()
            .map_err(|e| HostError::Poisoned(e.to_string()))?;
        state.calls.push(line.clone());

        if self.dry {
            return Ok(String::new());
        }
        if state.failures.iter().any(|f| *f == line || f == program) {
            return Err(HostError::CommandFailed {
                command: line,
                status: "exit status: 1".to_owned(),
                stderr: "simulated failure".to_owned(),
            });
        }
        Ok(state
            .outputs
            .get(&line)
            .or_else(|| state.outputs.get(program))
            .cloned()
            .unwrap_or_default())
    }

    fn is_dry(&self) -> bool {
        self.dry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_runner_captures_stdout() {
        let runner = SystemCommandRunner::new(false);
        let out = runner.run("echo", &["hello", "world"]).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn system_runner_reports_failure() {
        let runner = SystemCommandRunner::new(false);
        let err = runner.run("false", &[]).unwrap_err();
        assert!(matches!(err, HostError::CommandFailed { .. }));
    }

    #[test]
    fn system_runner_reports_missing_binary() {
        let runner = SystemCommandRunner::new(false);
        let err = runner
            .run("stratum-definitely-not-installed", &[])
            .unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }

    #[test]
    fn dry_runner_executes_nothing() {
        let runner = SystemCommandRunner::new(true);
        assert!(runner.is_dry());
        assert_eq!(runner.run("false", &[]).unwrap(), "");
    }

    #[test]
    fn recording_runner_matches_line_then_program() {
        let runner = RecordingRunner::new();
        runner.respond("lvs", "generic");
        runner.respond("lvs --noheadings -o origin vg/lv", "Image-0.0");
        assert_eq!(
            runner.run("lvs", &["--noheadings", "-o", "origin", "vg/lv"]).unwrap(),
            "Image-0.0"
        );
        assert_eq!(runner.run("lvs", &["-o", "lv_name"]).unwrap(), "generic");
        assert_eq!(runner.run("tune2fs", &["-U", "random"]).unwrap(), "");
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn recording_runner_failures() {
        let runner = RecordingRunner::new();
        runner.fail("umount");
        assert!(runner.run("umount", &["/mnt"]).is_err());
        assert!(runner.run("mount", &["/dev/x", "/mnt"]).is_ok());
    }
}
