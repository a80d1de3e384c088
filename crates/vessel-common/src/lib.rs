//! # vessel-common
//!
//! Shared types for the Vessel container construction engine:
//! - Common error taxonomy
//! - Standard filesystem paths
//! - Session ID generation

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{VesselError, VesselResult};
pub use id::SessionId;
