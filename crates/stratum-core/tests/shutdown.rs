//! Shutdown requests are process-wide, so these run in their own binary.

use std::sync::Arc;
use stratum_core::{request_shutdown, CoreError, Engine, EngineConfig, HookEvent, NEW_BASE_ADDED};
use stratum_host::{
    Host, LogicalVolume, MockBootloader, MockMountService, MockVolumeManager, RecordingRunner,
    VolumeManager,
};

#[test]
fn shutdown_during_init_still_boots_a_layer() {
    let dir = tempfile::tempdir().unwrap();
    let lvm = MockVolumeManager::new(dir.path().join("dev")).with_pool(
        "HostVG",
        "ImagePool",
        "20G".parse().unwrap(),
    );
    let boot = MockBootloader::new();
    let mounts = MockMountService::new(dir.path().join("mnt"));
    mounts.seed_fstab("/dev/HostVG/root / ext4 defaults 1 1\n");
    let host = Host {
        runner: Arc::new(RecordingRunner::new()),
        volumes: Box::new(lvm.clone()),
        bootloader: Box::new(boot.clone()),
        mounts: Box::new(mounts),
    };
    let config = EngineConfig {
        hooks_dir: None,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, host).unwrap();
    lvm.add_foreign_volume("HostVG", "root", b"installed system")
        .unwrap();

    // Ctrl-C arrives once the base is locked
    engine
        .hooks()
        .connect(NEW_BASE_ADDED, |_: &HookEvent| {
            request_shutdown();
            Ok(())
        })
        .unwrap();

    let (base, layer) = engine.init_layout_from("HostVG/root").unwrap();
    assert_eq!(base.name, "Image-0.0");
    assert_eq!(layer.name, "Image-0.1");
    assert_eq!(boot.entries().len(), 1);
    assert!(
        !lvm.attributes(&LogicalVolume::from(&layer))
            .unwrap()
            .activation_skip
    );

    // nothing new starts after the request
    assert!(matches!(
        engine.add_bootable_layer(),
        Err(CoreError::Interrupted(_))
    ));
    assert!(matches!(
        engine.add_base("1G".parse().unwrap(), None),
        Err(CoreError::Interrupted(_))
    ));
    assert_eq!(boot.entries().len(), 1);
}
