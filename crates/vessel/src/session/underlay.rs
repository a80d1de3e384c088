//! Underlay layer.
//!
//! When overlayfs is unavailable (or forbidden, e.g. inside a user
//! namespace), the underlay builds a synthetic root under
//! `session/underlay/root`: entries of the mounted rootfs are bind-mounted
//! through, and bind destinations missing from the base image are staged
//! as real directories or files so the later binds have targets.
//! Directories that must both show through and grow new targets are
//! shadowed: recreated as real directories with their children bound one
//! level deeper.

use std::path::Path;

use vessel_common::{VesselError, VesselResult};

use crate::mount::flags::MS_BIND;
use crate::mount::plan::{MountPlan, Tag};
use crate::session::{missing_bind_targets, Session};

/// Underlay layer state.
///
/// The underlay keeps no configuration; everything it needs is derived
/// from the plan and the mounted rootfs at realization time.
#[derive(Debug, Default)]
pub struct Underlay;

/// Realize the underlay: populate `underlay/root` with bind-throughs of
/// the rootfs (registered at [`Tag::Layer`]) and staged targets for binds
/// the base image cannot receive.
///
/// Runs as an after-`PreLayer` hook; the rootfs is mounted by then.
pub fn realize(plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
    let targets = missing_bind_targets(plan, session);
    let rootfs = session.rootfs_path();
    tracing::debug!(staged = targets.len(), "realizing underlay");

    build_level(plan, session, &rootfs, "", &targets)?;
    session.update()
}

/// Build one directory level of the synthetic root.
///
/// `rel` is the container-absolute directory being built (empty for the
/// root). Recursion only descends into shadowed directories, so the depth
/// is bounded by the deepest staged target.
fn build_level(
    plan: &mut MountPlan,
    session: &mut Session,
    rootfs: &Path,
    rel: &str,
    targets: &[(String, bool)],
) -> VesselResult<()> {
    let rootfs_dir = if rel.is_empty() {
        rootfs.to_path_buf()
    } else {
        rootfs.join(rel.trim_start_matches('/'))
    };

    if rootfs_dir.is_dir() {
        let entries = std::fs::read_dir(&rootfs_dir).map_err(|err| {
            VesselError::session(format!("failed to read {}: {err}", rootfs_dir.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                VesselError::session(format!("failed to read {}: {err}", rootfs_dir.display()))
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = format!("{rel}/{name}");
            let under_rel = format!("/underlay/root{child_rel}");
            let file_type = entry.file_type().map_err(VesselError::Io)?;

            let shadowed = file_type.is_dir()
                && targets
                    .iter()
                    .any(|(dest, _)| dest.starts_with(&format!("{child_rel}/")));

            if shadowed {
                session.add_dir(&under_rel)?;
                build_level(plan, session, rootfs, &child_rel, targets)?;
            } else if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path()).map_err(VesselError::Io)?;
                session.add_symlink(&under_rel, &link.to_string_lossy())?;
            } else {
                if file_type.is_dir() {
                    session.add_dir(&under_rel)?;
                } else {
                    session.add_file(&under_rel, b"")?;
                }
                let bind_target = session.get_path(&under_rel)?;
                plan.add_bind(
                    Tag::Layer,
                    &entry.path().to_string_lossy(),
                    &bind_target.to_string_lossy(),
                    MS_BIND,
                )?;
            }
        }
    }

    // Stage target chains whose next component has no rootfs counterpart.
    let prefix = format!("{rel}/");
    for (dest, is_dir) in targets {
        let Some(remainder) = dest.strip_prefix(&prefix) else {
            continue;
        };
        let next = remainder.split('/').next().unwrap_or_default();
        if next.is_empty() {
            continue;
        }
        let in_rootfs = rootfs_dir.join(next);
        if in_rootfs.is_dir() {
            // Handled by shadow recursion above.
            continue;
        }
        if in_rootfs.exists() {
            tracing::warn!(destination = %dest, "bind target conflicts with a rootfs file, skipping");
            continue;
        }
        let under_rel = format!("/underlay/root{dest}");
        if *is_dir {
            session.add_dir(&under_rel)?;
        } else {
            session.add_file(&under_rel, b"")?;
        }
    }
    Ok(())
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

    fn underlay_session() -> (tempfile::TempDir, MountPlan, Session) {
        let base = tempfile::tempdir().unwrap();
        let mut plan = MountPlan::new(Box::new(NullMounter));
        let mut session =
            Session::new(base.path(), "tmpfs", 16, &mut plan, LayerKind::Underlay).unwrap();
        session.update().unwrap();
        (base, plan, session)
    }

    #[test]
    fn rootfs_entries_bind_through() {
        let (_base, mut plan, mut session) = underlay_session();
        let rootfs = session.rootfs_path();
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::create_dir_all(rootfs.join("usr/lib")).unwrap();
        std::os::unix::fs::symlink("usr/lib", rootfs.join("lib")).unwrap();

        realize(&mut plan, &mut session).unwrap();

        let binds: Vec<_> = plan
            .get_by_tag(Tag::Layer)
            .iter()
            .map(|p| p.destination.clone())
            .collect();
        let root = session.final_path();
        assert!(binds.contains(&root.join("etc").to_string_lossy().into_owned()));
        assert!(binds.contains(&root.join("usr").to_string_lossy().into_owned()));
        // Symlinks are recreated, not bound.
        assert_eq!(
            std::fs::read_link(root.join("lib")).unwrap(),
            std::path::PathBuf::from("usr/lib")
        );
    }

    #[test]
    fn missing_targets_are_staged() {
        let (_base, mut plan, mut session) = underlay_session();
        plan.add_bind(Tag::Scratch, "/tmp", "/scratch/work", 0).unwrap();

        realize(&mut plan, &mut session).unwrap();

        assert!(session.final_path().join("scratch/work").is_dir());
    }

    #[test]
    fn existing_dirs_with_new_children_are_shadowed() {
        let (_base, mut plan, mut session) = underlay_session();
        let rootfs = session.rootfs_path();
        std::fs::create_dir_all(rootfs.join("var/log")).unwrap();
        plan.add_bind(Tag::Binds, "/tmp", "/var/cache", 0).unwrap();

        realize(&mut plan, &mut session).unwrap();

        let root = session.final_path();
        // /var is a real staged directory, its existing child binds
        // through, and the new target exists alongside it.
        assert!(root.join("var").is_dir());
        assert!(root.join("var/cache").is_dir());
        let binds: Vec<_> = plan
            .get_by_tag(Tag::Layer)
            .iter()
            .map(|p| p.destination.clone())
            .collect();
        assert!(binds.contains(&root.join("var/log").to_string_lossy().into_owned()));
        assert!(!binds.contains(&root.join("var").to_string_lossy().into_owned()));
    }

    #[test]
    fn file_targets_are_staged_as_files() {
        let (_base, mut plan, mut session) = underlay_session();
        let host_file = session.path().join("hostfile");
        std::fs::write(&host_file, b"x").unwrap();
        // A bind whose destination lives outside the session but whose
        // source is a plain file.
        plan.add_bind(Tag::Binds, &host_file.to_string_lossy(), "/etc/hostfile", 0)
            .unwrap();

        realize(&mut plan, &mut session).unwrap();

        assert!(session.final_path().join("etc/hostfile").is_file());
    }
}
