//! Overlayfs layer.
//!
//! Read-only overlay images contribute lower dirs; at most one writable
//! contribution provides the upper and work dirs. Realization emits a
//! single overlayfs mount at [`Tag::Layer`] over the rootfs.

use std::path::{Path, PathBuf};

use vessel_common::{VesselError, VesselResult};

use crate::mount::flags::{MS_NODEV, MS_NOSUID};
use crate::mount::plan::{MountPlan, Tag};
use crate::session::{missing_bind_targets, Layer, Session};

/// Accumulated overlayfs contributions.
#[derive(Debug, Default)]
pub struct Overlay {
    lower_dirs: Vec<String>,
    upper_dir: Option<String>,
    work_dir: Option<String>,
}

impl Overlay {
    /// Append a read-only lower dir. Earlier additions sit higher in the
    /// stack; the rootfs always ends up at the bottom.
    pub fn add_lower_dir(&mut self, path: impl Into<String>) {
        self.lower_dirs.push(path.into());
    }

    /// Declare the writable upper dir. Only one is allowed.
    pub fn add_upper_dir(&mut self, path: impl Into<String>) -> VesselResult<()> {
        if self.upper_dir.is_some() {
            return Err(VesselError::config(
                "only one writable overlay contribution is allowed",
            ));
        }
        self.upper_dir = Some(path.into());
        Ok(())
    }

    /// Declare the overlayfs work dir. Only one is allowed.
    pub fn add_work_dir(&mut self, path: impl Into<String>) -> VesselResult<()> {
        if self.work_dir.is_some() {
            return Err(VesselError::config(
                "only one overlay work directory is allowed",
            ));
        }
        self.work_dir = Some(path.into());
        Ok(())
    }

    /// Whether a writable contribution is present.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.upper_dir.is_some() && self.work_dir.is_some()
    }

    /// The accumulated lower dirs.
    #[must_use]
    pub fn lower_dirs(&self) -> &[String] {
        &self.lower_dirs
    }
}

/// Realize the overlay: stage missing bind targets, then register the
/// overlayfs mount at [`Tag::Layer`].
///
/// Runs as an after-`PreLayer` hook, once the overlay images are mounted
/// and any writable contribution has declared its upper/work dirs. With no
/// writable contribution the overlay mounts read-only and staged targets
/// ride along as the top lower dir.
pub fn realize(plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
    let (lowers, upper, work) = match session.layer() {
        Layer::Overlay(overlay) => (
            overlay.lower_dirs.clone(),
            overlay.upper_dir.clone(),
            overlay.work_dir.clone(),
        ),
        _ => return Err(VesselError::config("no overlay layer active")),
    };

    if upper.is_some() != work.is_some() {
        return Err(VesselError::config(
            "writable overlay requires both an upper and a work directory",
        ));
    }

    let stage_base = match &upper {
        Some(upper) => PathBuf::from(upper),
        None => session.get_path("/overlay/upper")?,
    };
    let staged = stage_targets(&stage_base, &missing_bind_targets(plan, session))?;

    let mut lower_list = Vec::new();
    if upper.is_none() && staged {
        lower_list.push(stage_base.to_string_lossy().into_owned());
    }
    lower_list.extend(lowers);
    lower_list.push(session.rootfs_path().to_string_lossy().into_owned());

    tracing::debug!(lowerdir = %lower_list.join(":"), writable = upper.is_some(), "realizing overlay");

    plan.add_overlay(
        Tag::Layer,
        &session.final_path().to_string_lossy(),
        MS_NOSUID | MS_NODEV,
        &lower_list,
        upper.as_deref(),
        work.as_deref(),
    )
}

/// Create the missing bind targets under `base`; returns whether anything
/// was staged.
fn stage_targets(base: &Path, targets: &[(String, bool)]) -> VesselResult<bool> {
    for (dest, is_dir) in targets {
        let target = base.join(dest.trim_start_matches('/'));
        tracing::debug!(target = %target.display(), "staging overlay bind target");
        if *is_dir {
            std::fs::create_dir_all(&target)
                .map_err(|err| VesselError::session(format!("failed to stage {dest}: {err}")))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| VesselError::session(format!("failed to stage {dest}: {err}")))?;
            }
            if !target.exists() {
                std::fs::write(&target, b"")
                    .map_err(|err| VesselError::session(format!("failed to stage {dest}: {err}")))?;
            }
        }
    }
    Ok(!targets.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::mounter::Mounter;
    use crate::mount::plan::MountPoint;
    use crate::session::LayerKind;

    struct NullMounter;

    impl Mounter for NullMounter {
        fn mount(&mut self, _point: &MountPoint, _session: &Session) -> VesselResult<()> {
            Ok(())
        }
    }

    fn overlay_session() -> (tempfile::TempDir, MountPlan, Session) {
        let base = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::new(Box::new(NullMounter));
        let mut session =
            Session::new(base.path(), "tmpfs", 16, &mut plan, LayerKind::Overlay).unwrap();
        session.update().unwrap();
        (base, plan, session)
    }

    fn layer(session: &mut Session) -> &mut Overlay {
        match session.layer_mut() {
            Layer::Overlay(overlay) => overlay,
            _ => unreachable!(),
        }
    }

    #[test]
    fn writable_overlay_mount() {
        let (_base, mut plan, mut session) = overlay_session();
        let upper = session.path().join("images/0/upper");
        let work = session.path().join("images/0/work");

        let overlay = layer(&mut session);
        overlay.add_lower_dir("/lower/b");
        overlay.add_upper_dir(upper.to_string_lossy()).unwrap();
        overlay.add_work_dir(work.to_string_lossy()).unwrap();

        realize(&mut plan, &mut session).unwrap();

        let points = plan.get_by_tag(Tag::Layer);
        assert_eq!(points.len(), 1);
        let data = points[0].options.last().unwrap();
        let rootfs = session.rootfs_path();
        assert_eq!(
            data,
            &format!(
                "lowerdir=/lower/b:{},upperdir={},workdir={}",
                rootfs.display(),
                upper.display(),
                work.display()
            )
        );
        assert_eq!(points[0].destination, session.final_path().to_string_lossy());
    }

    #[test]
    fn read_only_overlay_omits_upper() {
        let (_base, mut plan, mut session) = overlay_session();
        layer(&mut session).add_lower_dir("/lower/a");

        realize(&mut plan, &mut session).unwrap();

        let data = plan.get_by_tag(Tag::Layer)[0].options.last().unwrap().clone();
        assert!(!data.contains("upperdir="));
        assert!(data.starts_with("lowerdir=/lower/a:"));
    }

    #[test]
    fn read_only_overlay_stages_targets_as_top_lower() {
        let (_base, mut plan, mut session) = overlay_session();
        plan.add_bind(Tag::Home, "/tmp", "/home/someone", 0).unwrap();

        realize(&mut plan, &mut session).unwrap();

        let staged = session.get_path("/overlay/upper").unwrap();
        assert!(staged.join("home/someone").is_dir());
        let data = plan.get_by_tag(Tag::Layer)[0].options.last().unwrap().clone();
        assert!(data.starts_with(&format!("lowerdir={}", staged.display())));
    }

    #[test]
    fn second_upper_rejected() {
        let mut overlay = Overlay::default();
        overlay.add_upper_dir("/one").unwrap();
        assert!(overlay.add_upper_dir("/two").is_err());
    }

    #[test]
    fn mismatched_upper_work_rejected() {
        let (_base, mut plan, mut session) = overlay_session();
        layer(&mut session).add_upper_dir("/only-upper").unwrap();
        assert!(realize(&mut plan, &mut session).is_err());
    }
}
