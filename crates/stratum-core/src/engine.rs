use crate::concurrency::shutdown_requested;
use crate::hooks::{
    script_handler, HookError, HookEvent, Hooks, NEW_BASE_ADDED, NEW_BASE_CREATED,
    NEW_LAYER_ADDED,
};
use crate::lifecycle::{validate_transition, ChainState};
use crate::CoreError;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratum_host::{
    digest_device, Fstab, Host, LogicalVolume, Permission, ScopedMount, Size,
    VolumeAttributes, VolumeManager,
};
use stratum_schema::{IdentifierCodec, Image, Inventory, NamingError, NamingScheme, SchemeConfig};
use tracing::{debug, info, warn};

pub const DEFAULT_HOOKS_DIR: &str = "/etc/stratum/hooks.d";

/// Tag carrying the content digest of a locked base.
pub const SEAL_TAG_PREFIX: &str = "stratum:blake3=";
pub const BASE_TAG: &str = "stratum:base";
pub const LAYER_TAG: &str = "stratum:layer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub scheme: SchemeConfig,
    /// Executable hook scripts; `None` disables script forwarding.
    pub hooks_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheme: SchemeConfig::default(),
            hooks_dir: Some(PathBuf::from(DEFAULT_HOOKS_DIR)),
        }
    }
}

/// The live volume listing of one volume group.
pub struct VolumeInventory<'a> {
    volumes: &'a dyn VolumeManager,
    vg: &'a str,
}

impl Inventory for VolumeInventory<'_> {
    fn names(&self) -> Result<Vec<String>, NamingError> {
        self.volumes
            .list_volumes(self.vg)
            .map_err(|e| NamingError::Inventory(Box::new(e)))
    }
}

/// Where `Engine::add_base_with_image` reads the filesystem image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    File(PathBuf),
    Stdin,
}

impl ImageSource {
    /// `-` stands for standard input.
    pub fn from_arg(arg: &Path) -> Self {
        if arg == Path::new("-") {
            ImageSource::Stdin
        } else {
            ImageSource::File(arg.to_path_buf())
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::File(path) => write!(f, "{}", path.display()),
            ImageSource::Stdin => f.write_str("standard input"),
        }
    }
}

/// Outcome of `Engine::verify` for one base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BaseIntegrity {
    Intact,
    /// The base is no longer read-only.
    Writable,
    Modified { expected: String, actual: String },
    /// No digest was recorded when the base was locked.
    Unsealed,
}

impl BaseIntegrity {
    pub fn is_intact(&self) -> bool {
        *self == BaseIntegrity::Intact
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BaseReport {
    pub base: Image,
    pub integrity: BaseIntegrity,
}

/// Live view of one image, as reported by `Engine::inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct ImageStatus {
    pub image: Image,
    pub device: String,
    pub attributes: VolumeAttributes,
    pub tags: Vec<String>,
    pub state: ChainState,
    /// False when an operation on this image was interrupted.
    pub settled: bool,
}

/// Orchestrates bases and bootable layers on one volume group.
///
/// Every query rebuilds the image tree from the live volume listing. Write
/// operations are ordered so that an interruption between two host calls
/// never leaves the previously bootable layer unbootable.
pub struct Engine {
    scheme: SchemeConfig,
    codec: IdentifierCodec,
    host: Host,
    hooks: Hooks,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Engine {
    /// Build an engine over `host`. The built-in hook points are created and,
    /// when a hooks directory is configured, its scripts receive every event.
    pub fn new(config: EngineConfig, host: Host) -> Result<Self, CoreError> {
        let codec = config.scheme.codec().map_err(NamingError::from)?;
        let hooks = Hooks::with_builtin();
        if let Some(dir) = config.hooks_dir {
            debug!("forwarding hook events to scripts in {}", dir.display());
            hooks.connect_all(script_handler(dir, Arc::clone(&host.runner)))?;
        }
        Ok(Self {
            scheme: config.scheme,
            codec,
            host,
            hooks,
        })
    }

    pub fn scheme(&self) -> &SchemeConfig {
        &self.scheme
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn is_dry(&self) -> bool {
        self.host.is_dry()
    }

    pub fn naming(&self) -> NamingScheme<VolumeInventory<'_>> {
        NamingScheme::new(
            self.codec.clone(),
            self.scheme.vg.as_str(),
            VolumeInventory {
                volumes: self.host.volumes.as_ref(),
                vg: &self.scheme.vg,
            },
        )
    }

    fn begin(&self, operation: &str) -> Result<(), CoreError> {
        if shutdown_requested() {
            return Err(CoreError::Interrupted(operation.to_owned()));
        }
        Ok(())
    }

    /// Where `image` stands according to the live listing and attributes.
    /// Volumes about to change never have a newer layer yet.
    fn live_state(&self, image: &Image) -> Result<ChainState, CoreError> {
        let listed = self.host.volumes.list_volumes(&self.scheme.vg)?;
        if !listed.iter().any(|name| *name == image.name) {
            return Ok(ChainState::Absent);
        }
        let attrs = self.host.volumes.attributes(&LogicalVolume::from(image))?;
        Ok(ChainState::observe(image.kind, &attrs, false))
    }

    /// Refuse to move `image` to `to` unless its live state allows it.
    /// Dry runs create nothing, so there is nothing to observe.
    fn advance(&self, image: &Image, to: ChainState) -> Result<(), CoreError> {
        if self.is_dry() {
            debug!("dry run: assuming {} may become {to}", image.lvm_name());
            return Ok(());
        }
        let from = self.live_state(image)?;
        debug!("{}: {from} -> {to}", image.lvm_name());
        validate_transition(from, to)
    }

    /// Create the thinpool, and the volume group first when `pvs` are given.
    pub fn init_layout(&self, pvs: &[String], pool_size: Size) -> Result<LogicalVolume, CoreError> {
        self.begin("init")?;
        if pool_size.is_zero() {
            return Err(CoreError::InvalidSize(pool_size.to_string()));
        }
        let vg = &self.scheme.vg;
        if !pvs.is_empty() {
            info!("creating volume group {vg} on {}", pvs.join(", "));
            self.host.volumes.create_volume_group(vg, pvs)?;
        }
        info!("creating thinpool {vg}/{} ({pool_size})", self.scheme.thinpool);
        let pool = self
            .host
            .volumes
            .create_thin_pool(vg, &self.scheme.thinpool, pool_size)?;
        Ok(pool)
    }

    /// Turn an existing, unmanaged volume into the first base and boot a
    /// layer on top of it. Returns the new base and layer.
    pub fn init_layout_from(&self, lvm_name: &str) -> Result<(Image, Image), CoreError> {
        self.begin("init")?;
        let existing = LogicalVolume::from_lvm_name(lvm_name)?;
        if existing.vg != self.scheme.vg {
            return Err(CoreError::ForeignVolumeGroup {
                volume: existing.lvm_name(),
                vg: self.scheme.vg.clone(),
            });
        }

        let base = self.naming().suggest_next_base(None)?;
        self.advance(&base, ChainState::BaseCreated)?;
        info!("creating base {} from {existing}", base.lvm_name());
        let lv = self.host.volumes.create_snapshot(&existing, &base.name)?;
        self.host.volumes.set_activation(&lv, true, true)?;
        let path = self.host.volumes.device_path(&lv)?;
        self.refresh_fs_identity(&base, &path)?;
        self.lock_base(&base, &lv, &path)?;

        // a locked base without its first layer boots nothing, so a
        // shutdown request no longer stops here
        let layer = self.add_layer_unchecked()?;
        Ok((base, layer))
    }

    /// Create, lock and seal a new base of `size`.
    ///
    /// `new-base-created` fires while the volume is still writable, so its
    /// handlers can populate it; `new-base-added` fires once it is locked.
    pub fn add_base(&self, size: Size, version: Option<u64>) -> Result<Image, CoreError> {
        self.begin("add base")?;
        if size.is_zero() {
            return Err(CoreError::InvalidSize(size.to_string()));
        }

        let base = self.naming().suggest_next_base(version)?;
        self.advance(&base, ChainState::BaseCreated)?;
        info!("creating base {} ({size})", base.lvm_name());
        let lv = self.host.volumes.create_thin_volume(
            &self.scheme.vg,
            &self.scheme.thinpool,
            &base.name,
            size,
        )?;
        let path = self.host.volumes.device_path(&lv)?;
        self.hooks.emit(NEW_BASE_CREATED, &[&path])?;
        self.lock_base(&base, &lv, &path)?;
        Ok(base)
    }

    /// `add_base`, with the contents of `source` written onto the new volume
    /// before it is locked.
    pub fn add_base_with_image(
        &self,
        size: Size,
        version: Option<u64>,
        source: ImageSource,
    ) -> Result<Image, CoreError> {
        let dry = self.is_dry();
        let id = self.hooks.connect(NEW_BASE_CREATED, move |event: &HookEvent| {
            write_image(&source, event, dry)
        })?;

        let result = self.add_base(size, version);
        if let Err(e) = self.hooks.disconnect(NEW_BASE_CREATED, id) {
            warn!("failed to disconnect image writer: {e}");
        }
        result
    }

    fn lock_base(&self, base: &Image, lv: &LogicalVolume, path: &str) -> Result<(), CoreError> {
        self.advance(base, ChainState::BaseLocked)?;
        self.host.volumes.set_permission(lv, Permission::ReadOnly)?;
        self.host.volumes.set_activation_skip(lv, true)?;
        self.seal(lv, path)?;
        self.host.volumes.add_tag(lv, BASE_TAG)?;
        info!("base {} locked", base.lvm_name());
        self.hooks.emit(NEW_BASE_ADDED, &[path])?;
        Ok(())
    }

    fn seal(&self, lv: &LogicalVolume, path: &str) -> Result<(), CoreError> {
        if self.is_dry() {
            debug!("dry run: not sealing {lv}");
            return Ok(());
        }
        let digest = digest_device(path)?;
        debug!("sealing {lv} with {digest}");
        self.host
            .volumes
            .add_tag(lv, &format!("{SEAL_TAG_PREFIX}{digest}"))?;
        Ok(())
    }

    fn refresh_fs_identity(&self, image: &Image, path: &str) -> Result<(), CoreError> {
        let label = format!("{}-fs", image.name);
        self.host
            .runner
            .run("tune2fs", &["-U", "random", "-L", &label, path])?;
        Ok(())
    }

    /// Snapshot the newest layer of the last base (or the base itself) into
    /// a new layer and make it the one that boots.
    pub fn add_bootable_layer(&self) -> Result<Image, CoreError> {
        self.begin("add layer")?;
        self.add_layer_unchecked()
    }

    fn add_layer_unchecked(&self) -> Result<Image, CoreError> {
        let naming = self.naming();
        let base = naming.last_base()?;
        let previous = match naming.last_layer(Some(&base)) {
            Ok(layer) => layer,
            Err(NamingError::NoLayer { .. }) => base.clone(),
            Err(e) => return Err(e.into()),
        };
        let next = naming.suggest_next_layer(Some(&base))?;
        info!("adding layer {} on top of {}", next.lvm_name(), previous.lvm_name());

        let volumes = self.host.volumes.as_ref();
        let previous_lv = LogicalVolume::from(&previous);

        // checked before anything changes: a layer left snapshotting by an
        // interrupted run cannot be superseded
        if previous.is_layer() {
            self.advance(&previous, ChainState::Superseded)?;
        }
        self.advance(&next, ChainState::Snapshotting)?;
        let next_lv = volumes.create_snapshot(&previous_lv, &next.name)?;

        self.advance(&next, ChainState::Activated)?;
        volumes.set_activation(&next_lv, true, true)?;
        volumes.set_activation_skip(&next_lv, false)?;
        let path = volumes.device_path(&next_lv)?;
        self.refresh_fs_identity(&next, &path)?;

        // bases keep their skip flag from lock_base
        if previous.is_layer() {
            volumes.set_activation_skip(&previous_lv, true)?;
        }
        volumes.set_activation(&previous_lv, true, true)?;

        self.host.bootloader.add_boot_entry(&next.lvm_name(), &path)?;

        let mount = ScopedMount::new(self.host.mounts.as_ref(), &path)?;
        let target = mount.target().to_string_lossy().into_owned();
        if !Fstab::rewrite_root(&Path::new(&target).join("etc/fstab"), &path, self.is_dry())? {
            warn!("{} has no root entry in its fstab", next.lvm_name());
        }
        self.hooks.emit(NEW_LAYER_ADDED, &["/", &path, &target])?;
        mount.release()?;

        volumes.add_tag(&next_lv, LAYER_TAG)?;
        info!("layer {} is ready", next.lvm_name());
        Ok(next)
    }

    fn image_of(&self, lv: &LogicalVolume) -> Result<Image, CoreError> {
        if lv.vg != self.scheme.vg || !self.codec.matches(&lv.name) {
            return Err(CoreError::NotAnImage(lv.lvm_name()));
        }
        Ok(self.naming().image_from_name(&lv.name)?)
    }

    /// Resolve `vg/lv` or a bare volume name to an image of this scheme.
    pub fn image_named(&self, name: &str) -> Result<Image, CoreError> {
        let lv = LogicalVolume::from_lvm_name(name)
            .unwrap_or_else(|_| LogicalVolume::new(&self.scheme.vg, name));
        self.image_of(&lv)
    }

    /// The image mounted at `/`.
    pub fn current_layer(&self) -> Result<Image, CoreError> {
        let source = self.host.mounts.mount_source(Path::new("/"))?;
        let lv = self.host.volumes.resolve_device(&source)?;
        debug!("/ is mounted from {source} ({lv})");
        self.image_of(&lv)
    }

    /// The base `name` descends from, following snapshot origins.
    pub fn base_of_layer(&self, name: &str) -> Result<Image, CoreError> {
        let image = self.image_named(name)?;
        if image.is_base() {
            return Ok(image);
        }

        let no_base = || CoreError::NoBaseFound(image.name.clone());
        let mut seen = HashSet::new();
        let mut lv = LogicalVolume::from(&image);
        loop {
            if !seen.insert(lv.name.clone()) {
                return Err(no_base());
            }
            let origin = self.host.volumes.origin(&lv)?.ok_or_else(no_base)?;
            if !self.codec.matches(&origin.name) {
                return Err(no_base());
            }
            let parent = self.image_of(&origin)?;
            if parent.is_base() {
                return Ok(parent);
            }
            lv = origin;
        }
    }

    /// Unused thinpool capacity in `units` (`b`, `k`, `m`, `g`, `t`, `s`).
    pub fn free_space(&self, units: &str) -> Result<f64, CoreError> {
        let usage = self
            .host
            .volumes
            .pool_usage(&self.scheme.vg, &self.scheme.thinpool, units)?;
        Ok(usage.free())
    }

    /// Check that a base is still read-only and unchanged since it was sealed.
    ///
    /// Locked bases skip activation, so an inactive base is activated for
    /// the digest and deactivated again afterwards.
    pub fn verify(&self, name: &str) -> Result<BaseIntegrity, CoreError> {
        let base = self.image_named(name)?;
        if !base.is_base() {
            return Err(CoreError::NotABase(base.name));
        }
        let lv = LogicalVolume::from(&base);
        let attrs = self.host.volumes.attributes(&lv)?;
        if attrs.permission == Permission::ReadWrite {
            return Ok(BaseIntegrity::Writable);
        }

        let tags = self.host.volumes.tags(&lv)?;
        let Some(expected) = tags.iter().find_map(|t| t.strip_prefix(SEAL_TAG_PREFIX)) else {
            return Ok(BaseIntegrity::Unsealed);
        };
        let activated = !attrs.active && !self.is_dry();
        if activated {
            debug!("activating {lv} to verify it");
            self.host.volumes.set_activation(&lv, true, true)?;
        }
        let actual = self.digest_volume(&lv);
        if activated {
            if let Err(e) = self.host.volumes.set_activation(&lv, false, true) {
                warn!("failed to deactivate {lv} after verifying it: {e}");
            }
        }
        let actual = actual?;
        if actual == expected {
            Ok(BaseIntegrity::Intact)
        } else {
            Ok(BaseIntegrity::Modified {
                expected: expected.to_owned(),
                actual,
            })
        }
    }

    fn digest_volume(&self, lv: &LogicalVolume) -> Result<String, CoreError> {
        let path = self.host.volumes.device_path(lv)?;
        Ok(digest_device(path)?)
    }

    /// `verify` every volume tagged as a base in this volume group.
    pub fn verify_all(&self) -> Result<Vec<BaseReport>, CoreError> {
        let mut bases: Vec<Image> = self
            .host
            .volumes
            .find_by_tag(BASE_TAG)?
            .iter()
            .filter(|lv| lv.vg == self.scheme.vg && self.codec.matches(&lv.name))
            .map(|lv| self.image_of(lv))
            .collect::<Result<_, _>>()?;
        bases.sort();

        bases
            .into_iter()
            .map(|base| {
                let integrity = self.verify(&base.name)?;
                Ok(BaseReport { base, integrity })
            })
            .collect()
    }

    pub fn latest_base(&self) -> Result<Image, CoreError> {
        Ok(self.naming().last_base()?)
    }

    pub fn latest_layer(&self) -> Result<Image, CoreError> {
        Ok(self.naming().last_layer(None)?)
    }

    pub fn layout(&self) -> Result<String, CoreError> {
        Ok(self.naming().layout()?)
    }

    pub fn bases(&self) -> Result<Vec<Image>, CoreError> {
        Ok(self.naming().bases()?)
    }

    pub fn layers(&self) -> Result<Vec<Image>, CoreError> {
        Ok(self.naming().layers()?)
    }

    pub fn inspect(&self, name: &str) -> Result<ImageStatus, CoreError> {
        let image = self.image_named(name)?;
        let tree = self.naming().tree()?;
        let base = tree
            .iter()
            .find(|b| b.version == image.version)
            .ok_or_else(|| NamingError::ImageNotFound(image.name.clone()))?;
        let has_successor = if image.is_base() {
            !base.layers.is_empty()
        } else {
            if !base.layers.contains(&image) {
                return Err(NamingError::ImageNotFound(image.name).into());
            }
            base.layers.iter().any(|l| l.release > image.release)
        };

        let lv = LogicalVolume::from(&image);
        let attributes = self.host.volumes.attributes(&lv)?;
        let state = ChainState::observe(image.kind, &attributes, has_successor);
        Ok(ImageStatus {
            device: self.host.volumes.device_path(&lv)?,
            tags: self.host.volumes.tags(&lv)?,
            settled: state.is_settled(),
            state,
            attributes,
            image,
        })
    }
}

fn write_image(source: &ImageSource, event: &HookEvent, dry: bool) -> Result<(), HookError> {
    let Some(device) = event.args.first() else {
        return Err(HookError::Failed {
            hook: event.name.clone(),
            reason: "missing device argument".to_owned(),
        });
    };
    if dry {
        info!("dry run: would write {source} to {device}");
        return Ok(());
    }

    info!("writing {source} to {device}");
    let device = Path::new(device);
    let written = match source {
        ImageSource::File(path) => {
            let mut input = File::open(path).map_err(|e| HookError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            copy_image(&mut input, device)?
        }
        ImageSource::Stdin => copy_image(&mut std::io::stdin().lock(), device)?,
    };
    debug!("wrote {written} bytes to {}", device.display());
    Ok(())
}

fn copy_image(input: &mut dyn Read, device: &Path) -> Result<u64, HookError> {
    let io_err = |source| HookError::Io {
        path: device.display().to_string(),
        source,
    };
    let mut output = OpenOptions::new().write(true).open(device).map_err(io_err)?;
    let written = std::io::copy(input, &mut output).map_err(io_err)?;
    output.sync_all().map_err(io_err)?;
    Ok(written)
}
