//! Named hook points with ordered, fail-fast handlers.
//!
//! The engine announces lifecycle milestones through a `Hooks` table. Each
//! hook point is declared with its argument names; handlers connected to a
//! point run in registration order, followed by the catch-all handlers that
//! see every emission. The first failing handler stops the emission.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use stratum_host::{CommandRunner, HostError};
use thiserror::Error;
use tracing::{debug, info};

pub const NEW_BASE_CREATED: &str = "new-base-created";
pub const NEW_BASE_ADDED: &str = "new-base-added";
pub const NEW_LAYER_ADDED: &str = "new-layer-added";

const BUILTIN_HOOKS: [(&str, &[&str]); 3] = [
    (NEW_BASE_CREATED, &["new-lv"]),
    (NEW_BASE_ADDED, &["new-lv"]),
    (NEW_LAYER_ADDED, &["old-target", "new-lv", "new-target"]),
];

#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook '{0}'")]
    UnknownHook(String),
    #[error("hook '{0}' already exists")]
    AlreadyExists(String),
    #[error("hook '{name}' takes {expected} argument(s) ({params}), got {got}")]
    ArgumentCount {
        name: String,
        expected: usize,
        params: String,
        got: usize,
    },
    #[error("no handler {id} connected to '{name}'")]
    UnknownHandler { name: String, id: HandlerId },
    #[error("handler for '{hook}' failed: {reason}")]
    Failed { hook: String, reason: String },
    #[error("hook script {script} failed: {source}")]
    Script { script: String, source: HostError },
    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("hook table lock poisoned: {0}")]
    Poisoned(String),
}

/// One emission as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub name: String,
    pub args: Vec<String>,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Handler = Arc<dyn Fn(&HookEvent) -> Result<(), HookError> + Send + Sync>;

struct HookPoint {
    params: Vec<String>,
    handlers: Vec<(HandlerId, Handler)>,
}

#[derive(Default)]
struct HookTable {
    points: HashMap<String, HookPoint>,
    catch_all: Vec<(HandlerId, Handler)>,
    next_id: u64,
}

impl HookTable {
    fn insert_point(&mut self, name: &str, params: &[&str]) -> Result<(), HookError> {
        if self.points.contains_key(name) {
            return Err(HookError::AlreadyExists(name.to_owned()));
        }
        self.points.insert(
            name.to_owned(),
            HookPoint {
                params: params.iter().map(|p| (*p).to_owned()).collect(),
                handlers: Vec::new(),
            },
        );
        Ok(())
    }

    fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

#[derive(Default)]
pub struct Hooks {
    table: Mutex<HookTable>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self
            .table
            .lock()
            .map(|t| t.points.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        f.debug_struct("Hooks").field("points", &names).finish()
    }
}

impl Hooks {
    /// An empty table without any hook points.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the lifecycle hook points the engine emits.
    pub fn with_builtin() -> Self {
        let mut table = HookTable::default();
        for (name, params) in BUILTIN_HOOKS {
            let _ = table.insert_point(name, params);
        }
        Self {
            table: Mutex::new(table),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HookTable>, HookError> {
        self.table
            .lock()
            .map_err(|e| HookError::Poisoned(e.to_string()))
    }

    pub fn create(&self, name: &str, params: &[&str]) -> Result<(), HookError> {
        self.lock()?.insert_point(name, params)
    }

    pub fn params(&self, name: &str) -> Result<Vec<String>, HookError> {
        self.lock()?
            .points
            .get(name)
            .map(|p| p.params.clone())
            .ok_or_else(|| HookError::UnknownHook(name.to_owned()))
    }

    pub fn connect<F>(&self, name: &str, handler: F) -> Result<HandlerId, HookError>
    where
        F: Fn(&HookEvent) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let mut table = self.lock()?;
        let id = table.allocate_id();
        table
            .points
            .get_mut(name)
            .ok_or_else(|| HookError::UnknownHook(name.to_owned()))?
            .handlers
            .push((id, Arc::new(handler)));
        debug!("connected handler {id} to '{name}'");
        Ok(id)
    }

    pub fn disconnect(&self, name: &str, id: HandlerId) -> Result<(), HookError> {
        let mut table = self.lock()?;
        let point = table
            .points
            .get_mut(name)
            .ok_or_else(|| HookError::UnknownHook(name.to_owned()))?;
        let before = point.handlers.len();
        point.handlers.retain(|(h, _)| *h != id);
        if point.handlers.len() == before {
            return Err(HookError::UnknownHandler {
                name: name.to_owned(),
                id,
            });
        }
        Ok(())
    }

    /// Connect a handler invoked for every emission, after the named ones.
    pub fn connect_all<F>(&self, handler: F) -> Result<HandlerId, HookError>
    where
        F: Fn(&HookEvent) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let mut table = self.lock()?;
        let id = table.allocate_id();
        table.catch_all.push((id, Arc::new(handler)));
        Ok(id)
    }

    pub fn disconnect_all(&self, id: HandlerId) -> Result<(), HookError> {
        let mut table = self.lock()?;
        let before = table.catch_all.len();
        table.catch_all.retain(|(h, _)| *h != id);
        if table.catch_all.len() == before {
            return Err(HookError::UnknownHandler {
                name: "*".to_owned(),
                id,
            });
        }
        Ok(())
    }

    pub fn emit(&self, name: &str, args: &[&str]) -> Result<(), HookError> {
        // handlers run without the table lock held, so they may connect or
        // disconnect themselves
        let handlers: Vec<Handler> = {
            let table = self.lock()?;
            let point = table
                .points
                .get(name)
                .ok_or_else(|| HookError::UnknownHook(name.to_owned()))?;
            if point.params.len() != args.len() {
                return Err(HookError::ArgumentCount {
                    name: name.to_owned(),
                    expected: point.params.len(),
                    params: point.params.join(", "),
                    got: args.len(),
                });
            }
            point
                .handlers
                .iter()
                .chain(table.catch_all.iter())
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        let event = HookEvent {
            name: name.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        };
        debug!("emitting '{event}' to {} handler(s)", handlers.len());
        for handler in handlers {
            handler(&event)?;
        }
        Ok(())
    }
}

/// Executable regular files in `dir`, sorted by file name.
pub fn hook_scripts(dir: &Path) -> Result<Vec<PathBuf>, HookError> {
    let io_err = |source| HookError::Io {
        path: dir.display().to_string(),
        source,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err)?;
        let metadata = entry.metadata().map_err(io_err)?;
        if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
            scripts.push(entry.path());
        }
    }
    scripts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(scripts)
}

/// Catch-all handler forwarding every event to the scripts in `dir` as
/// `script <event> <args...>`. The directory is rescanned per emission.
pub fn script_handler(
    dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
) -> impl Fn(&HookEvent) -> Result<(), HookError> + Send + Sync + 'static {
    move |event: &HookEvent| {
        for script in hook_scripts(&dir)? {
            let program = script.to_string_lossy();
            let mut args: Vec<&str> = vec![event.name.as_str()];
            args.extend(event.args.iter().map(String::as_str));
            info!("running hook {program} {event}");
            runner
                .run(&program, &args)
                .map_err(|source| HookError::Script {
                    script: program.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use stratum_host::RecordingRunner;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(&HookEvent) -> Result<(), HookError> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event: &HookEvent| {
            log.lock().unwrap().push(format!("{tag}: {event}"));
            Ok(())
        }
    }

    #[test]
    fn builtin_points_exist() {
        let hooks = Hooks::with_builtin();
        assert_eq!(hooks.params(NEW_BASE_ADDED).unwrap(), vec!["new-lv"]);
        assert_eq!(
            hooks.params(NEW_LAYER_ADDED).unwrap(),
            vec!["old-target", "new-lv", "new-target"]
        );
        assert!(matches!(
            hooks.create(NEW_BASE_CREATED, &["x"]),
            Err(HookError::AlreadyExists(_))
        ));
    }

    #[test]
    fn named_handlers_run_before_catch_alls() {
        let hooks = Hooks::new();
        hooks.create("pre-update", &["target"]).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        hooks.connect_all(recorder(&log, "all")).unwrap();
        hooks.connect("pre-update", recorder(&log, "first")).unwrap();
        hooks.connect("pre-update", recorder(&log, "second")).unwrap();

        hooks.emit("pre-update", &["/"]).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first: pre-update /", "second: pre-update /", "all: pre-update /"]
        );
    }

    #[test]
    fn first_failure_stops_emission() {
        let hooks = Hooks::new();
        hooks.create("h", &[]).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        hooks.connect("h", recorder(&log, "a")).unwrap();
        hooks
            .connect("h", |_: &HookEvent| {
                Err(HookError::Failed {
                    hook: "h".to_owned(),
                    reason: "boom".to_owned(),
                })
            })
            .unwrap();
        hooks.connect("h", recorder(&log, "c")).unwrap();
        hooks.connect_all(recorder(&log, "all")).unwrap();

        let err = hooks.emit("h", &[]).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(*log.lock().unwrap(), vec!["a: h"]);
    }

    #[test]
    fn unknown_hook_and_wrong_arity() {
        let hooks = Hooks::with_builtin();
        assert!(matches!(
            hooks.emit("nope", &[]),
            Err(HookError::UnknownHook(_))
        ));
        assert!(matches!(
            hooks.connect("nope", |_: &HookEvent| Ok(())),
            Err(HookError::UnknownHook(_))
        ));
        let err = hooks.emit(NEW_LAYER_ADDED, &["/"]).unwrap_err();
        assert!(matches!(
            err,
            HookError::ArgumentCount {
                expected: 3,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn disconnect_removes_only_that_handler() {
        let hooks = Hooks::new();
        hooks.create("h", &[]).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = hooks.connect("h", recorder(&log, "a")).unwrap();
        hooks.connect("h", recorder(&log, "b")).unwrap();
        let all = hooks.connect_all(recorder(&log, "all")).unwrap();

        hooks.disconnect("h", a).unwrap();
        hooks.disconnect_all(all).unwrap();
        hooks.emit("h", &[]).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b: h"]);

        assert!(matches!(
            hooks.disconnect("h", a),
            Err(HookError::UnknownHandler { .. })
        ));
        assert!(hooks.disconnect_all(all).is_err());
    }

    fn write_script(dir: &Path, name: &str, mode: u32) {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn scripts_sorted_and_executable_only() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "20-second", 0o755);
        write_script(dir.path(), "10-first", 0o700);
        write_script(dir.path(), "README", 0o644);
        fs::create_dir(dir.path().join("30-dir")).unwrap();

        let names: Vec<_> = hook_scripts(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["10-first", "20-second"]);
    }

    #[test]
    fn missing_hooks_dir_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hook_scripts(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn script_handler_forwards_event() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "50-notify", 0o755);
        let runner = RecordingRunner::new();

        let hooks = Hooks::with_builtin();
        hooks
            .connect_all(script_handler(
                dir.path().to_path_buf(),
                Arc::new(runner.clone()),
            ))
            .unwrap();
        hooks
            .emit(NEW_BASE_ADDED, &["/dev/HostVG/Image-1.0"])
            .unwrap();

        let script = dir.path().join("50-notify");
        assert_eq!(
            runner.calls(),
            vec![format!(
                "{} new-base-added /dev/HostVG/Image-1.0",
                script.display()
            )]
        );
    }

    #[test]
    fn failing_script_propagates() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "10-broken", 0o755);
        let script = dir.path().join("10-broken");
        let runner = RecordingRunner::new();
        runner.fail(&script.to_string_lossy());

        let hooks = Hooks::with_builtin();
        hooks
            .connect_all(script_handler(dir.path().to_path_buf(), Arc::new(runner)))
            .unwrap();
        let err = hooks.emit(NEW_BASE_ADDED, &["/dev/x"]).unwrap_err();
        assert!(matches!(err, HookError::Script { .. }));
    }
}
