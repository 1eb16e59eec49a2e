use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stratum_core::{
    BaseIntegrity, ChainState, CoreError, Engine, EngineConfig, HookError, HookEvent, ImageSource,
    NEW_LAYER_ADDED,
};
use stratum_host::{
    Host, LogicalVolume, MockBootloader, MockMountService, MockVolumeManager, Permission,
    RecordingRunner, VolumeManager,
};
use stratum_schema::NamingError;

const FSTAB: &str = "\
# /etc/fstab
/dev/HostVG/root / ext4 defaults,discard 1 1
UUID=2b1c /boot ext4 defaults 1 2
";

struct Rig {
    dir: tempfile::TempDir,
    lvm: MockVolumeManager,
    boot: MockBootloader,
    mounts: MockMountService,
    runner: RecordingRunner,
    engine: Engine,
}

fn rig_with_hooks(hooks_dir: Option<PathBuf>) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let lvm = MockVolumeManager::new(dir.path().join("dev")).with_pool(
        "HostVG",
        "ImagePool",
        "20G".parse().unwrap(),
    );
    let boot = MockBootloader::new();
    let mounts = MockMountService::new(dir.path().join("mnt"));
    mounts.seed_fstab(FSTAB);
    let runner = RecordingRunner::new();
    let host = Host {
        runner: Arc::new(runner.clone()),
        volumes: Box::new(lvm.clone()),
        bootloader: Box::new(boot.clone()),
        mounts: Box::new(mounts.clone()),
    };
    let config = EngineConfig {
        hooks_dir,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, host).unwrap();
    Rig {
        dir,
        lvm,
        boot,
        mounts,
        runner,
        engine,
    }
}

fn rig() -> Rig {
    rig_with_hooks(None)
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn init_from_existing_root_end_to_end() {
    let r = rig();
    let root = r
        .lvm
        .add_foreign_volume("HostVG", "root", b"installed system")
        .unwrap();

    let (base, layer) = r.engine.init_layout_from("HostVG/root").unwrap();
    assert_eq!(base.name, "Image-0.0");
    assert_eq!(layer.name, "Image-0.1");

    // the installed volume is only ever read from
    assert!(!r.lvm.journal().iter().any(|e| {
        e.split_whitespace().nth(1) == Some("HostVG/root") && !e.starts_with("create_snapshot")
    }));
    assert_eq!(r.lvm.attributes(&root).unwrap().permission, Permission::ReadWrite);

    assert_eq!(
        r.engine.layout().unwrap(),
        "Image-0.0\n └╼ Image-0.1"
    );

    let device = r.lvm.device_path(&LogicalVolume::from(&layer)).unwrap();
    assert_eq!(
        r.boot.entries(),
        vec![("HostVG/Image-0.1".to_owned(), device.clone())]
    );

    let (mounted, target) = r.mounts.history().pop().unwrap();
    assert_eq!(mounted, device);
    let fstab = fs::read_to_string(target.join("etc/fstab")).unwrap();
    assert!(fstab.contains(&format!("{device} / ext4 defaults,discard 1 1")));
    assert!(fstab.contains("UUID=2b1c /boot ext4 defaults 1 2"));
    assert!(r.mounts.active().is_empty());

    r.mounts.set_mount_source("/", &device);
    assert_eq!(r.engine.current_layer().unwrap(), layer);
    assert!(r.engine.verify("Image-0.0").unwrap().is_intact());
}

#[test]
fn layers_chain_on_the_last_base() {
    let r = rig();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    for _ in 0..3 {
        r.engine.add_bootable_layer().unwrap();
    }

    assert_eq!(r.engine.latest_layer().unwrap().name, "Image-1.3");
    assert_eq!(
        r.lvm
            .origin(&LogicalVolume::new("HostVG", "Image-1.3"))
            .unwrap(),
        Some(LogicalVolume::new("HostVG", "Image-1.2"))
    );
    let names: Vec<_> = r
        .engine
        .layers()
        .unwrap()
        .into_iter()
        .map(|l| l.name)
        .collect();
    assert_eq!(names, vec!["Image-1.1", "Image-1.2", "Image-1.3"]);
    assert_eq!(r.engine.base_of_layer("Image-1.3").unwrap().name, "Image-1.0");

    // only the newest layer boots automatically
    let skip = |name: &str| {
        r.lvm
            .attributes(&LogicalVolume::new("HostVG", name))
            .unwrap()
            .activation_skip
    };
    assert!(skip("Image-1.1"));
    assert!(skip("Image-1.2"));
    assert!(!skip("Image-1.3"));
}

#[test]
fn foreign_volumes_do_not_disturb_the_layout() {
    let r = rig();
    r.lvm.add_foreign_volume("HostVG", "swap", b"").unwrap();
    r.lvm.add_foreign_volume("HostVG", "Image-1.0-fs", b"").unwrap();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    assert_eq!(r.engine.layout().unwrap(), "Image-0.0");
}

#[test]
fn empty_volume_group_asks_for_init() {
    let r = rig();
    let err = r.engine.layout().unwrap_err();
    assert!(matches!(
        err,
        CoreError::Naming(NamingError::NoValidLayout(_))
    ));
    assert!(err.to_string().contains("initialize"));
    assert!(matches!(
        r.engine.add_bootable_layer(),
        Err(CoreError::Naming(NamingError::NoBasesFound { .. }))
    ));
}

#[test]
fn zero_padded_names_are_not_images() {
    let r = rig();
    r.lvm.add_foreign_volume("HostVG", "Image-01.0", b"").unwrap();
    assert!(matches!(
        r.engine.add_bootable_layer(),
        Err(CoreError::Naming(NamingError::NoBasesFound { .. }))
    ));
    assert!(matches!(
        r.engine.image_named("Image-01.0"),
        Err(CoreError::NotAnImage(_))
    ));

    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    assert_eq!(r.engine.layout().unwrap(), "Image-0.0");
}

#[test]
fn missing_volume_group_is_a_host_error() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host {
        runner: Arc::new(RecordingRunner::new()),
        volumes: Box::new(MockVolumeManager::new(dir.path())),
        bootloader: Box::new(MockBootloader::new()),
        mounts: Box::new(MockMountService::new(dir.path())),
    };
    let config = EngineConfig {
        hooks_dir: None,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, host).unwrap();

    let err = engine.layout().unwrap_err();
    assert!(matches!(err, CoreError::Host(_)), "{err:?}");
    assert!(err.to_string().starts_with("host error:"));
    assert!(matches!(engine.latest_base(), Err(CoreError::Host(_))));
    assert!(matches!(
        engine.add_base("1G".parse().unwrap(), None),
        Err(CoreError::Host(_))
    ));
}

#[test]
fn interrupted_supersede_keeps_previous_layer_bootable() {
    let r = rig();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    let previous = r.engine.add_bootable_layer().unwrap();
    let previous_lv = LogicalVolume::from(&previous);
    let before = r.lvm.attributes(&previous_lv).unwrap();

    r.lvm
        .fail_on("set_activation_skip", Some("HostVG/Image-0.1"));
    let err = r.engine.add_bootable_layer().unwrap_err();
    assert!(matches!(err, CoreError::Host(_)));

    assert_eq!(r.lvm.attributes(&previous_lv).unwrap(), before);
    assert!(!before.activation_skip);
    assert_eq!(r.boot.entries().len(), 1);
    // activated once when it was created, never re-activated
    let activations = r
        .lvm
        .journal()
        .iter()
        .filter(|e| e.starts_with("set_activation HostVG/Image-0.1 "))
        .count();
    assert_eq!(activations, 1);

    // the half-made layer is visible as such
    let status = r.engine.inspect("Image-0.2").unwrap();
    assert_eq!(status.state, ChainState::Activated);
    assert_eq!(
        r.engine.inspect("Image-0.1").unwrap().state,
        ChainState::Activated
    );
}

#[test]
fn interrupted_snapshot_is_reported_unsettled() {
    let r = rig();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    r.lvm.fail_on("set_activation", Some("HostVG/Image-0.1"));
    assert!(r.engine.add_bootable_layer().is_err());

    let status = r.engine.inspect("Image-0.1").unwrap();
    assert_eq!(status.state, ChainState::Snapshotting);
    assert!(!status.settled);
    assert!(r.boot.entries().is_empty());
}

#[test]
fn verify_detects_tampering() {
    let r = rig();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    assert!(r.engine.verify_all().unwrap().iter().all(|b| b.integrity.is_intact()));

    let device = r.lvm.device_file("HostVG/Image-1.0").unwrap();
    fs::write(&device, b"modified after sealing").unwrap();
    match r.engine.verify("Image-1.0").unwrap() {
        BaseIntegrity::Modified { expected, actual } => {
            assert_eq!(expected, blake3::hash(b"").to_hex().to_string());
            assert_eq!(
                actual,
                blake3::hash(b"modified after sealing").to_hex().to_string()
            );
        }
        other => panic!("expected modification, got {other:?}"),
    }

    r.lvm
        .set_permission(&LogicalVolume::new("HostVG", "Image-0.0"), Permission::ReadWrite)
        .unwrap();
    let reports = r.engine.verify_all().unwrap();
    let states: Vec<_> = reports
        .iter()
        .map(|b| (b.base.name.as_str(), &b.integrity))
        .collect();
    assert_eq!(states[0], ("Image-0.0", &BaseIntegrity::Writable));
    assert!(matches!(states[1].1, BaseIntegrity::Modified { .. }));
}

#[test]
fn verify_activates_an_inactive_base() {
    let r = rig();
    let base = r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    let lv = LogicalVolume::from(&base);
    r.lvm.set_activation(&lv, false, true).unwrap();
    let device = PathBuf::from(r.lvm.device_path(&lv).unwrap());
    assert!(!device.exists());

    assert!(r.engine.verify(&base.name).unwrap().is_intact());
    assert!(r
        .lvm
        .journal()
        .contains(&"set_activation HostVG/Image-0.0 y K".to_owned()));
    // left the way it was found
    assert!(!r.lvm.attributes(&lv).unwrap().active);
    assert!(!device.exists());

    let hidden = r.lvm.device_file(&base.lvm_name()).unwrap();
    fs::write(&hidden, b"changed while inactive").unwrap();
    assert!(matches!(
        r.engine.verify(&base.name).unwrap(),
        BaseIntegrity::Modified { .. }
    ));
    assert!(!r.lvm.attributes(&lv).unwrap().active);
}

#[test]
fn unsealed_base_is_reported() {
    let r = rig();
    let root = r.lvm.add_foreign_volume("HostVG", "root", b"").unwrap();
    let base = r.lvm.create_snapshot(&root, "Image-5.0").unwrap();
    r.lvm.set_permission(&base, Permission::ReadOnly).unwrap();
    assert_eq!(r.engine.verify("Image-5.0").unwrap(), BaseIntegrity::Unsealed);
}

#[test]
fn base_from_image_is_sealed_with_its_content() {
    let r = rig();
    let image = r.dir.path().join("rootfs.img");
    fs::write(&image, b"squashed root filesystem").unwrap();

    let base = r
        .engine
        .add_base_with_image("1G".parse().unwrap(), None, ImageSource::File(image))
        .unwrap();
    let device = r.lvm.device_file(&base.lvm_name()).unwrap();
    assert_eq!(fs::read(&device).unwrap(), b"squashed root filesystem");
    assert!(r.engine.verify(&base.name).unwrap().is_intact());

    // the writer is gone once the base exists
    let plain = r.engine.add_base("1G".parse().unwrap(), None).unwrap();
    let device = r.lvm.device_file(&plain.lvm_name()).unwrap();
    assert!(fs::read(&device).unwrap().is_empty());
}

#[test]
fn missing_image_fails_and_disconnects() {
    let r = rig();
    let err = r
        .engine
        .add_base_with_image(
            "1G".parse().unwrap(),
            None,
            ImageSource::File("/nonexistent.img".into()),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Hook(HookError::Io { .. })));
    // the half-made base was never locked
    let status = r.engine.inspect("Image-0.0").unwrap();
    assert_eq!(status.state, ChainState::BaseCreated);

    assert!(r.engine.add_base("1G".parse().unwrap(), None).is_ok());
}

#[test]
fn layer_hook_runs_inside_the_mount() {
    let r = rig();
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    r.engine
        .hooks()
        .connect(NEW_LAYER_ADDED, move |event: &HookEvent| {
            let fstab = fs::read_to_string(Path::new(&event.args[2]).join("etc/fstab"))
                .map_err(|e| HookError::Failed {
                    hook: event.name.clone(),
                    reason: e.to_string(),
                })?;
            log.lock().unwrap().push((event.args.clone(), fstab));
            Ok(())
        })
        .unwrap();

    let layer = r.engine.add_bootable_layer().unwrap();
    let device = r.lvm.device_file(&layer.lvm_name()).unwrap();
    let device = device.to_string_lossy();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (args, fstab) = &seen[0];
    assert_eq!(args[0], "/");
    assert_eq!(args[1], device);
    assert!(fstab.contains(&format!("{device} / ext4")));
}

#[test]
fn failing_hook_aborts_and_releases_mount() {
    let hooks_dir = tempfile::tempdir().unwrap();
    let script = write_script(hooks_dir.path(), "10-notify", "exit 0");
    let r = rig_with_hooks(Some(hooks_dir.path().to_path_buf()));
    r.engine.add_base("1G".parse().unwrap(), None).unwrap();

    r.engine
        .hooks()
        .connect(NEW_LAYER_ADDED, |event: &HookEvent| {
            Err(HookError::Failed {
                hook: event.name.clone(),
                reason: "refusing".to_owned(),
            })
        })
        .unwrap();

    let err = r.engine.add_bootable_layer().unwrap_err();
    assert!(matches!(err, CoreError::Hook(HookError::Failed { .. })));
    assert!(r.mounts.active().is_empty());
    assert_eq!(r.mounts.history().len(), 1);

    // the script saw the base events but not the aborted layer event
    let script = script.display().to_string();
    let script_calls: Vec<_> = r
        .runner
        .calls()
        .into_iter()
        .filter(|c| c.starts_with(&script))
        .collect();
    assert_eq!(script_calls.len(), 2);
    assert!(script_calls[0].contains(" new-base-created "));
    assert!(script_calls[1].contains(" new-base-added "));
}

#[test]
fn dry_mode_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let entries = dir.path().join("entries");
    fs::create_dir(&entries).unwrap();
    let marker = dir.path().join("hook-ran");
    let hooks_dir = dir.path().join("hooks.d");
    write_script(&hooks_dir, "10-touch", &format!("touch {}", marker.display()));
    let image = dir.path().join("rootfs.img");
    fs::write(&image, b"image").unwrap();

    let config = EngineConfig {
        hooks_dir: Some(hooks_dir),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, Host::system(true, &entries)).unwrap();
    assert!(engine.is_dry());

    let base = engine
        .add_base_with_image("1G".parse().unwrap(), Some(3), ImageSource::File(image))
        .unwrap();
    assert_eq!(base.name, "Image-3.0");

    assert!(!marker.exists());
    assert_eq!(fs::read_dir(&entries).unwrap().count(), 0);
    assert!(engine.add_bootable_layer().is_err());
}
