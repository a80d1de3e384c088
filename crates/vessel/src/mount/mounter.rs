//! Mount execution strategies.
//!
//! A [`Mounter`] performs the OS side of one [`MountPoint`]. The plan holds
//! exactly one; the assembler swaps the in-process [`DirectMounter`] for an
//! [`RpcMounter`] once the layer is established, so that every later mount
//! goes through the narrower privileged helper.

use std::cell::RefCell;
use std::ffi::CString;
use std::path::Path;
use std::rc::Rc;

use vessel_common::{VesselError, VesselResult};

use crate::mount::flags::{self, MS_BIND, MS_RDONLY, MS_REMOUNT};
use crate::mount::loopdev::{self, LoopInfo64};
use crate::mount::plan::MountPoint;
use crate::rpc::RpcClient;
use crate::session::Session;

/// Performs the OS mount for one point.
pub trait Mounter {
    /// Mount `point`, honoring the silent-skip policy for host targets.
    fn mount(&mut self, point: &MountPoint, session: &Session) -> VesselResult<()>;
}

/// A mount point with its destination resolved against the session.
#[derive(Debug)]
pub struct ResolvedMount {
    /// Kernel flag bits.
    pub flags: u64,
    /// Comma-joined kernel data string.
    pub data: String,
    /// Actual mount target on the host.
    pub destination: String,
}

/// Apply the silent-skip policy and resolve the real mount target.
///
/// - A bind (without remount) whose host source is missing is skipped.
/// - A destination outside the session resolves relative to the session's
///   final root and is skipped when that target does not exist yet.
/// - A destination inside the session must exist; a missing one is a bug
///   in session staging and fails hard.
///
/// Returns `Ok(None)` for a skipped point.
pub fn resolve_mount(point: &MountPoint, session: &Session) -> VesselResult<Option<ResolvedMount>> {
    let (mount_flags, passthrough) = flags::convert_options(&point.options);
    let remount = mount_flags & MS_REMOUNT != 0;

    if mount_flags & MS_BIND != 0 && !remount && !Path::new(&point.source).exists() {
        tracing::debug!(source = %point.source, "skipping mount, host source doesn't exist");
        return Ok(None);
    }

    let session_path = session.path().to_string_lossy().into_owned();
    let destination = if point.destination.starts_with(&session_path) {
        if !Path::new(&point.destination).exists() {
            return Err(VesselError::mount(format!(
                "destination {} doesn't exist",
                point.destination
            )));
        }
        point.destination.clone()
    } else {
        let inside = format!(
            "{}{}",
            session.final_path().to_string_lossy(),
            point.destination
        );
        if !Path::new(&inside).exists() {
            tracing::debug!(destination = %inside, "skipping mount, target doesn't exist in container");
            return Ok(None);
        }
        inside
    };

    Ok(Some(ResolvedMount {
        flags: mount_flags,
        data: passthrough.join(","),
        destination,
    }))
}

/// Restores the caller's credential state when dropped.
///
/// While alive, the effective UID is 0 with the filesystem UID demoted to
/// the real user, so `mount(2)` is permitted but every path permission
/// check sees the user's credentials. On drop the effective UID becomes
/// the real user, keeping UID 0 in the saved slot for the next swap.
struct CredGuard {
    uid: libc::uid_t,
}

impl CredGuard {
    fn engage() -> VesselResult<Self> {
        let uid = rustix::process::getuid().as_raw();
        // SAFETY: plain credential syscalls, checked return values.
        if unsafe { libc::setresuid(uid, 0, uid) } != 0 {
            return Err(VesselError::Priv {
                operation: "failed to elevate privileges".to_string(),
            });
        }
        unsafe { libc::setfsuid(uid) };
        if unsafe { libc::setfsuid(uid) } != uid as libc::c_int {
            return Err(VesselError::Priv {
                operation: "failed to set filesystem UID".to_string(),
            });
        }
        Ok(Self { uid })
    }
}

impl Drop for CredGuard {
    fn drop(&mut self) {
        // SAFETY: restoring the pre-swap credential layout.
        if unsafe { libc::setresuid(self.uid, self.uid, 0) } != 0 {
            tracing::error!("failed to restore credentials after mount");
        }
    }
}

/// In-process mounter issuing `mount(2)` directly.
///
/// Outside a user namespace every mount runs under a [`CredGuard`] so bind
/// sources are evaluated against the invoking user's permissions, not
/// root's.
pub struct DirectMounter {
    user_ns: bool,
}

impl DirectMounter {
    /// Create a direct mounter; `user_ns` disables the credential swap.
    #[must_use]
    pub fn new(user_ns: bool) -> Self {
        Self { user_ns }
    }

    fn mount_generic(&self, point: &MountPoint, session: &Session) -> VesselResult<()> {
        let Some(resolved) = resolve_mount(point, session)? else {
            return Ok(());
        };

        if resolved.flags & MS_REMOUNT != 0 {
            tracing::debug!(destination = %resolved.destination, "remounting");
        } else {
            tracing::debug!(source = %point.source, destination = %resolved.destination, "mounting");
        }

        if let Err(errno) = do_mount(
            &point.source,
            &resolved.destination,
            &point.fstype,
            resolved.flags,
            &resolved.data,
        ) {
            if resolved.flags & MS_REMOUNT != 0 {
                return Err(VesselError::mount(format!(
                    "can't remount {}: {errno}",
                    resolved.destination
                )));
            }
            tracing::debug!(source = %point.source, error = %errno, "can't mount, skipping");
        }
        Ok(())
    }

    fn mount_image(&self, point: &MountPoint) -> VesselResult<()> {
        let (mount_flags, passthrough) = flags::convert_options(&point.options);
        let data = passthrough.join(",");

        let offset = flags::offset(&point.internal_options)?.unwrap_or(0);
        let size_limit = flags::size_limit(&point.internal_options)?.unwrap_or(0);

        // The original engine compared `flags & MS_RDONLY == 1`; the
        // non-zero test is the intended semantics.
        let read_only = mount_flags & MS_RDONLY != 0;

        let mut loop_flags = loopdev::LO_FLAGS_AUTOCLEAR;
        if read_only {
            loop_flags |= loopdev::LO_FLAGS_READ_ONLY;
        }

        let info = LoopInfo64 {
            lo_offset: offset,
            lo_sizelimit: size_limit,
            lo_flags: loop_flags,
            ..LoopInfo64::default()
        };

        let device = loopdev::attach(&point.source, read_only)?;
        device.set_status(&info)?;

        let device_path = device.path();
        tracing::debug!(device = %device_path, destination = %point.destination, "mounting loop device");
        do_mount(
            &device_path,
            &point.destination,
            &point.fstype,
            mount_flags,
            &data,
        )
        .map_err(|errno| {
            VesselError::mount(format!("failed to mount {} filesystem: {errno}", point.fstype))
        })
    }
}

impl Mounter for DirectMounter {
    fn mount(&mut self, point: &MountPoint, session: &Session) -> VesselResult<()> {
        let _creds = if self.user_ns {
            None
        } else {
            Some(CredGuard::engage()?)
        };

        if flags::offset(&point.internal_options)?.is_some() {
            self.mount_image(point)
                .map_err(|err| VesselError::mount(format!("can't mount image {}: {err}", point.source)))
        } else {
            self.mount_generic(point, session)
        }
    }
}

/// Mounter delegating each point to the privileged helper over RPC.
pub struct RpcMounter {
    client: Rc<RefCell<dyn RpcClient>>,
}

impl RpcMounter {
    /// Create a mounter proxying to `client`.
    #[must_use]
    pub fn new(client: Rc<RefCell<dyn RpcClient>>) -> Self {
        Self { client }
    }
}

impl Mounter for RpcMounter {
    fn mount(&mut self, point: &MountPoint, session: &Session) -> VesselResult<()> {
        let Some(resolved) = resolve_mount(point, session)? else {
            return Ok(());
        };

        if resolved.flags & MS_REMOUNT != 0 {
            tracing::debug!(destination = %resolved.destination, "remounting via helper");
        } else {
            tracing::debug!(source = %point.source, destination = %resolved.destination, "mounting via helper");
        }

        match self.client.borrow_mut().mount(
            &point.source,
            &resolved.destination,
            &point.fstype,
            resolved.flags,
            &resolved.data,
        ) {
            Ok(()) => Ok(()),
            Err(err @ VesselError::Rpc { .. }) => Err(err),
            Err(err) => {
                if resolved.flags & MS_REMOUNT != 0 {
                    Err(VesselError::mount(format!(
                        "can't remount {}: {err}",
                        resolved.destination
                    )))
                } else {
                    tracing::debug!(source = %point.source, error = %err, "can't mount, skipping");
                    Ok(())
                }
            }
        }
    }
}

/// Thin `mount(2)` wrapper keeping the raw flag bits intact.
fn do_mount(
    source: &str,
    target: &str,
    fstype: &str,
    mount_flags: u64,
    data: &str,
) -> Result<(), std::io::Error> {
    let fstype_c = CString::new(fstype).map_err(std::io::Error::other)?;
    let data_c = CString::new(data).map_err(std::io::Error::other)?;
    let flags = rustix::mount::MountFlags::from_bits_retain(mount_flags as _);

    rustix::mount::mount(
        if source.is_empty() { "none" } else { source },
        target,
        fstype_c.as_c_str(),
        flags,
        data_c.as_c_str(),
    )
    .map_err(Into::into)
}
