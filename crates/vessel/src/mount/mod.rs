//! Mount planning and execution.

pub mod flags;
pub mod loopdev;
pub mod mounter;
pub mod plan;

pub use mounter::{DirectMounter, Mounter, RpcMounter};
pub use plan::{AfterTagHook, MountPlan, MountPoint, Tag};
