//! Tagged, ordered mount plan.
//!
//! The plan is a registry of mount points keyed by [`Tag`] plus after-tag
//! hooks. [`MountPlan::mount_all`] replays it once, in tag order, through
//! the pluggable [`Mounter`] held on the plan.

use std::collections::BTreeMap;

use vessel_common::{VesselError, VesselResult};

use crate::mount::flags;
use crate::mount::mounter::Mounter;
use crate::session::Session;

/// Execution stage of a mount point.
///
/// Tags execute in declaration order; within a tag, points mount in
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    /// Session tmpfs establishment.
    Session,
    /// Root filesystem image.
    Rootfs,
    /// Overlay image mounts and rootfs remounts, before the layer exists.
    PreLayer,
    /// Layer realization (overlayfs mount or underlay bind-throughs).
    Layer,
    /// Device nodes.
    Dev,
    /// Host filesystem bind-throughs.
    Hostfs,
    /// Administrator-configured binds.
    Binds,
    /// Kernel pseudo-filesystems.
    Kernel,
    /// User home directory.
    Home,
    /// Temporary directories.
    Tmp,
    /// Scratch directories.
    Scratch,
    /// Current working directory.
    Cwd,
    /// User-requested binds.
    Userbinds,
    /// Identity files (passwd, group).
    Files,
    /// Anything with no dedicated stage.
    Other,
    /// Last-word mounts that nothing may eclipse.
    Final,
}

impl Tag {
    /// Every tag, in execution order.
    pub const ALL: [Tag; 16] = [
        Tag::Session,
        Tag::Rootfs,
        Tag::PreLayer,
        Tag::Layer,
        Tag::Dev,
        Tag::Hostfs,
        Tag::Binds,
        Tag::Kernel,
        Tag::Home,
        Tag::Tmp,
        Tag::Scratch,
        Tag::Cwd,
        Tag::Userbinds,
        Tag::Files,
        Tag::Other,
        Tag::Final,
    ];
}

/// One planned mount operation.
#[derive(Debug, Clone)]
pub struct MountPoint {
    /// Path, device, or fd-path the mount reads from. Empty for remounts.
    pub source: String,
    /// Absolute path inside the eventual root, or inside the session.
    pub destination: String,
    /// Filesystem name; empty for binds and remounts.
    pub fstype: String,
    /// Option tokens, translated to flags by the mounter.
    pub options: Vec<String>,
    /// `key=value` tokens consumed by the engine, never by the kernel.
    pub internal_options: Vec<String>,
}

impl MountPoint {
    /// Kernel flag bits encoded in this point's options.
    #[must_use]
    pub fn flags(&self) -> u64 {
        flags::convert_options(&self.options).0
    }
}

/// Deferred callback fired after every point of one tag has been mounted.
///
/// Hooks may mutate the session and append to the plan for later tags
/// only; touching the current or an earlier tag is unsupported.
pub type AfterTagHook = Box<dyn FnMut(&mut MountPlan, &mut Session) -> VesselResult<()>>;

/// Tagged ordered registry of mount points and after-tag hooks.
pub struct MountPlan {
    points: BTreeMap<Tag, Vec<MountPoint>>,
    hooks: BTreeMap<Tag, Vec<AfterTagHook>>,
    mounter: Box<dyn Mounter>,
    drained: bool,
}

impl MountPlan {
    /// Create an empty plan replayed through `mounter`.
    #[must_use]
    pub fn new(mounter: Box<dyn Mounter>) -> Self {
        Self {
            points: BTreeMap::new(),
            hooks: BTreeMap::new(),
            mounter,
            drained: false,
        }
    }

    /// Replace the mounter used for all subsequent points.
    ///
    /// Typically invoked by an after-tag hook once the layer is in place,
    /// switching from the in-process mounter to RPC delegation.
    pub fn set_mounter(&mut self, mounter: Box<dyn Mounter>) {
        self.mounter = mounter;
    }

    /// Register a filesystem mount.
    pub fn add_fs(
        &mut self,
        tag: Tag,
        destination: &str,
        fstype: &str,
        mount_flags: u64,
        data: &str,
    ) -> VesselResult<()> {
        let mut options = flags::options_from_flags(mount_flags, &[]);
        if !data.is_empty() {
            options.push(data.to_string());
        }
        self.add_point(
            tag,
            MountPoint {
                source: fstype.to_string(),
                destination: destination.to_string(),
                fstype: fstype.to_string(),
                options,
                internal_options: Vec::new(),
            },
        )
    }

    /// Register a bind mount. `MS_BIND` is implied.
    pub fn add_bind(
        &mut self,
        tag: Tag,
        source: &str,
        destination: &str,
        mount_flags: u64,
    ) -> VesselResult<()> {
        if source.is_empty() {
            return Err(VesselError::config("bind mount requires a source"));
        }
        self.add_point(
            tag,
            MountPoint {
                source: source.to_string(),
                destination: destination.to_string(),
                fstype: String::new(),
                options: flags::options_from_flags(mount_flags | flags::MS_BIND, &[]),
                internal_options: Vec::new(),
            },
        )
    }

    /// Register a remount of an existing destination to apply restricting
    /// flags. `MS_REMOUNT | MS_BIND` is implied.
    pub fn add_remount(&mut self, tag: Tag, destination: &str, mount_flags: u64) -> VesselResult<()> {
        self.add_point(
            tag,
            MountPoint {
                source: String::new(),
                destination: destination.to_string(),
                fstype: String::new(),
                options: flags::options_from_flags(
                    mount_flags | flags::MS_REMOUNT | flags::MS_BIND,
                    &[],
                ),
                internal_options: Vec::new(),
            },
        )
    }

    /// Register a loop-backed image mount.
    ///
    /// `source` is normally an fd-path (`/proc/self/fd/<n>`) of the held
    /// image file; `offset`/`size` travel as internal options and trigger
    /// loop-device setup inside the mounter.
    #[allow(clippy::too_many_arguments)]
    pub fn add_image(
        &mut self,
        tag: Tag,
        source: &str,
        destination: &str,
        fstype: &str,
        mount_flags: u64,
        offset: u64,
        size: u64,
    ) -> VesselResult<()> {
        if source.is_empty() {
            return Err(VesselError::config("image mount requires a source"));
        }
        self.add_point(
            tag,
            MountPoint {
                source: source.to_string(),
                destination: destination.to_string(),
                fstype: fstype.to_string(),
                options: flags::options_from_flags(mount_flags, &[]),
                internal_options: vec![format!("offset={offset}"), format!("sizelimit={size}")],
            },
        )
    }

    /// Register an overlayfs mount assembled from lower/upper/work dirs.
    pub fn add_overlay(
        &mut self,
        tag: Tag,
        destination: &str,
        mount_flags: u64,
        lower_dirs: &[String],
        upper_dir: Option<&str>,
        work_dir: Option<&str>,
    ) -> VesselResult<()> {
        let mut data = format!("lowerdir={}", lower_dirs.join(":"));
        match (upper_dir, work_dir) {
            (Some(upper), Some(work)) => {
                data.push_str(&format!(",upperdir={upper},workdir={work}"));
            }
            (None, None) => {}
            _ => {
                return Err(VesselError::config(
                    "writable overlay requires both an upper and a work directory",
                ));
            }
        }
        self.add_fs(tag, destination, "overlay", mount_flags, &data)
    }

    /// Register a hook fired after every point of `tag` has been mounted.
    pub fn run_after_tag(&mut self, tag: Tag, hook: AfterTagHook) -> VesselResult<()> {
        self.hooks.entry(tag).or_default().push(hook);
        Ok(())
    }

    /// All points registered under `tag`, in insertion order.
    #[must_use]
    pub fn get_by_tag(&self, tag: Tag) -> &[MountPoint] {
        self.points.get(&tag).map_or(&[], Vec::as_slice)
    }

    /// Replay the whole plan: for each tag in order, mount every point,
    /// then fire the tag's hooks in registration order.
    ///
    /// # Errors
    ///
    /// The first mounter or hook error aborts the replay and propagates.
    /// The plan performs no unwinding; teardown belongs to the caller.
    /// A second call is an error — the state transition is linear.
    pub fn mount_all(&mut self, session: &mut Session) -> VesselResult<()> {
        if self.drained {
            return Err(VesselError::session("mount plan already executed"));
        }
        self.drained = true;

        for tag in Tag::ALL {
            let points = self.points.get(&tag).cloned().unwrap_or_default();
            for point in &points {
                tracing::trace!(?tag, destination = %point.destination, "mounting");
                self.mounter.mount(point, session)?;
            }
            let hooks = self.hooks.remove(&tag).unwrap_or_default();
            for mut hook in hooks {
                hook(self, session)?;
            }
        }
        Ok(())
    }

    fn add_point(&mut self, tag: Tag, point: MountPoint) -> VesselResult<()> {
        if !point.destination.starts_with('/') {
            return Err(VesselError::config(format!(
                "mount destination must be absolute: {}",
                point.destination
            )));
        }
        self.points.entry(tag).or_default().push(point);
        Ok(())
    }
}
