//! Session staging area.
//!
//! The session is a per-invocation directory on a tmpfs whose contents
//! become (or shadow) the container's root. Staged entries — directories,
//! files, symlinks — are recorded first and materialized by [`Session::update`]
//! once the session tmpfs is mounted; hooks that add entries later call
//! `update` again.

pub mod overlay;
pub mod underlay;

use std::path::{Path, PathBuf};

use vessel_common::paths::session_fs_data;
use vessel_common::{SessionId, VesselError, VesselResult};

use crate::mount::flags::{MS_BIND, MS_NODEV, MS_NOSUID, MS_REMOUNT};
use crate::mount::plan::{MountPlan, Tag};

pub use overlay::Overlay;
pub use underlay::Underlay;

/// Layer strategy chosen for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Rootfs mounted directly at the session root.
    None,
    /// Kernel overlayfs over the rootfs and overlay images.
    Overlay,
    /// Synthetic lower view built from bind mounts.
    Underlay,
}

/// Layer state held by the session.
pub enum Layer {
    /// No layer; writes go wherever the rootfs allows them.
    None,
    /// Overlayfs layer.
    Overlay(Overlay),
    /// Underlay layer.
    Underlay(Underlay),
}

enum EntryKind {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

struct Entry {
    rel: String,
    kind: EntryKind,
    created: bool,
}

/// Tmpfs-backed staging directory producing the container's future root.
pub struct Session {
    path: PathBuf,
    layer: Layer,
    entries: Vec<Entry>,
}

impl Session {
    /// Create a session under `base` and register its tmpfs (of `fs_type`,
    /// bounded to `size_mb` MiB when non-zero) at the plan's
    /// [`Tag::Session`] stage, together with the hook that materializes
    /// staged entries once the tmpfs is mounted.
    pub fn new(
        base: &Path,
        fs_type: &str,
        size_mb: usize,
        plan: &mut MountPlan,
        layer: LayerKind,
    ) -> VesselResult<Self> {
        let id = SessionId::generate();
        let path = base.join(id.as_str());
        std::fs::create_dir_all(&path).map_err(|err| {
            VesselError::session(format!("failed to create session directory: {err}"))
        })?;
        tracing::debug!(path = %path.display(), "created session directory");

        plan.add_fs(
            Tag::Session,
            &path.to_string_lossy(),
            fs_type,
            MS_NOSUID | MS_NODEV,
            &session_fs_data(size_mb),
        )?;
        plan.run_after_tag(Tag::Session, Box::new(|_, session| session.update()))?;

        let mut session = Self {
            path,
            layer: Layer::None,
            entries: Vec::new(),
        };

        match layer {
            LayerKind::None => {}
            LayerKind::Overlay => {
                for dir in ["/overlay/lower", "/overlay/upper", "/overlay/work", "/overlay/root"] {
                    session.add_dir(dir)?;
                }
                session.layer = Layer::Overlay(Overlay::default());
            }
            LayerKind::Underlay => {
                session.add_dir("/rootfs")?;
                session.add_dir("/underlay/root")?;
                session.layer = Layer::Underlay(Underlay::default());
            }
        }
        Ok(session)
    }

    /// The session root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the rootfs image gets mounted, depending on the layer.
    #[must_use]
    pub fn rootfs_path(&self) -> PathBuf {
        match self.layer {
            Layer::None => self.path.clone(),
            Layer::Overlay(_) => self.path.join("overlay/lower"),
            Layer::Underlay(_) => self.path.join("rootfs"),
        }
    }

    /// What becomes the container root after `chroot`.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        match self.layer {
            Layer::None => self.path.clone(),
            Layer::Overlay(_) => self.path.join("overlay/root"),
            Layer::Underlay(_) => self.path.join("underlay/root"),
        }
    }

    /// The active layer.
    #[must_use]
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Mutable access to the active layer.
    pub fn layer_mut(&mut self) -> &mut Layer {
        &mut self.layer
    }

    /// Absolute path of a session-relative entry.
    pub fn get_path(&self, rel: &str) -> VesselResult<PathBuf> {
        Ok(self.path.join(Self::checked_rel(rel)?))
    }

    /// Stage a directory (and its parents) under the session.
    pub fn add_dir(&mut self, rel: &str) -> VesselResult<()> {
        self.add_entry(rel, EntryKind::Dir)
    }

    /// Stage a file with the given content (empty for none).
    pub fn add_file(&mut self, rel: &str, content: &[u8]) -> VesselResult<()> {
        self.add_entry(rel, EntryKind::File(content.to_vec()))
    }

    /// Stage a symlink pointing at `target`.
    pub fn add_symlink(&mut self, rel: &str, target: &str) -> VesselResult<()> {
        self.add_entry(rel, EntryKind::Symlink(target.to_string()))
    }

    /// Materialize every staged entry not yet on disk.
    ///
    /// Safe to call repeatedly; each entry is created once.
    pub fn update(&mut self) -> VesselResult<()> {
        for entry in self.entries.iter_mut().filter(|e| !e.created) {
            let target = self.path.join(&entry.rel);
            match &entry.kind {
                EntryKind::Dir => {
                    std::fs::create_dir_all(&target)
                        .map_err(|err| stage_error(&target, err))?;
                }
                EntryKind::File(content) => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|err| stage_error(parent, err))?;
                    }
                    std::fs::write(&target, content)
                        .map_err(|err| stage_error(&target, err))?;
                }
                EntryKind::Symlink(link_target) => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|err| stage_error(parent, err))?;
                    }
                    match std::os::unix::fs::symlink(link_target, &target) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                        Err(err) => return Err(stage_error(&target, err)),
                    }
                }
            }
            entry.created = true;
        }
        Ok(())
    }

    fn add_entry(&mut self, rel: &str, kind: EntryKind) -> VesselResult<()> {
        let rel = Self::checked_rel(rel)?;
        if let EntryKind::Dir = kind {
            if self.entries.iter().any(|e| e.rel == rel && matches!(e.kind, EntryKind::Dir)) {
                return Ok(());
            }
        }
        self.entries.push(Entry {
            rel,
            kind,
            created: false,
        });
        Ok(())
    }

    /// Validate a session-relative path: absolute, no escaping components.
    fn checked_rel(rel: &str) -> VesselResult<String> {
        if !rel.starts_with('/') {
            return Err(VesselError::session(format!(
                "session path must be absolute: {rel}"
            )));
        }
        if rel.split('/').any(|component| component == "..") {
            return Err(VesselError::session(format!(
                "session path escapes the session root: {rel}"
            )));
        }
        Ok(rel.trim_start_matches('/').to_string())
    }
}

fn stage_error(path: &Path, err: std::io::Error) -> VesselError {
    VesselError::session(format!("failed to stage {}: {err}", path.display()))
}

/// Container-absolute bind destinations of later-tag points that are
/// missing from the mounted rootfs, with whether the host source is a
/// directory.
///
/// This is the set of targets a layer must synthesize so the binds have
/// something to land on. Points whose host source is already gone are
/// excluded: the mounter will skip them anyway.
pub(crate) fn missing_bind_targets(plan: &MountPlan, session: &Session) -> Vec<(String, bool)> {
    let rootfs = session.rootfs_path();
    let session_prefix = session.path().to_string_lossy().into_owned();
    let mut targets = Vec::new();

    for tag in Tag::ALL.into_iter().filter(|tag| *tag > Tag::Layer) {
        for point in plan.get_by_tag(tag) {
            let flags = point.flags();
            if flags & MS_BIND == 0 || flags & MS_REMOUNT != 0 {
                continue;
            }
            if point.destination.starts_with(&session_prefix) {
                continue;
            }
            let source = Path::new(&point.source);
            if !source.exists() {
                continue;
            }
            let in_rootfs = rootfs.join(point.destination.trim_start_matches('/'));
            if in_rootfs.exists() {
                continue;
            }
            if !targets.iter().any(|(dest, _)| dest == &point.destination) {
                targets.push((point.destination.clone(), source.is_dir()));
            }
        }
    }
    targets
}
