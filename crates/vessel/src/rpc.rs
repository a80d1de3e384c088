//! Interface to the privileged helper.
//!
//! The engine delegates post-layer mounts and the final chroot to a small
//! privileged helper over an opaque transport. The transport must deliver
//! calls in order, reliably, for the lifetime of the process; any
//! transport failure surfaces as [`VesselError::Rpc`] and is fatal.
//!
//! [`VesselError::Rpc`]: vessel_common::VesselError::Rpc

use vessel_common::VesselResult;

/// Client side of the privileged helper.
pub trait RpcClient {
    /// Perform `mount(2)` in the helper.
    fn mount(
        &mut self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u64,
        data: &str,
    ) -> VesselResult<()>;

    /// Perform `chroot(2)` in the helper.
    fn chroot(&mut self, path: &str) -> VesselResult<()>;
}
