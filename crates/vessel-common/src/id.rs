//! Session ID generation and validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{VesselError, VesselResult};

/// A validated per-invocation session ID.
///
/// Session IDs name the staging directory under the session base and must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Maximum length of a session ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new session ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> VesselResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random session ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let hex = hex::encode(&uuid.as_bytes()[..6]);
        Self(hex)
    }

    /// Get the session ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a session ID string.
    fn validate(id: &str) -> VesselResult<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(VesselError::Session {
                message: format!("invalid session ID length: {}", id.len()),
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(VesselError::Session {
                message: format!("invalid session ID: {id}"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = VesselError;

    fn from_str(s: &str) -> VesselResult<Self> {
        Self::new(s)
    }
}
