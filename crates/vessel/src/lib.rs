//! # Vessel container construction engine
//!
//! Vessel assembles a complete container view of the filesystem — rootfs,
//! kernel pseudo-filesystems, device nodes, user home, temporary and
//! scratch space, working directory, and identity files — inside a private
//! mount namespace, then pivots the calling process into it.
//!
//! The engine is built from three cooperating pieces:
//!
//! - [`mount::MountPlan`]: a tagged, ordered registry of mount operations
//!   with after-tag hooks, replayed through a pluggable [`mount::Mounter`]
//!   so each mount runs either in-process or delegated to a privileged
//!   helper over RPC.
//! - [`session::Session`]: a tmpfs-backed staging area representing the
//!   container's future root, shaped by an overlay, underlay, or plain
//!   layer strategy.
//! - [`container`]: the policy layer deciding, per concern, what goes into
//!   the plan based on administrator configuration, the invocation
//!   request, and runtime detection.
//!
//! The core is single-threaded and synchronous; see the crate-level
//! concurrency notes on [`container::create`].

#![warn(missing_docs)]

pub mod config;
pub mod container;
pub mod identity;
pub mod image;
pub mod mount;
pub mod oci;
pub mod proc;
pub mod rpc;
pub mod session;
