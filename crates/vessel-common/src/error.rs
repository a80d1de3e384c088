//! Common error types for the Vessel engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VesselError`].
pub type VesselResult<T> = Result<T, VesselError>;

/// Errors produced while constructing a container.
///
/// Every fatal error surfaces exactly once to the caller; warnings go
/// through the log sink and never abort the run.
#[derive(Error, Diagnostic, Debug)]
pub enum VesselError {
    /// Malformed or contradictory engine configuration.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(vessel::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Image open, format discrimination, or partition resolution failed.
    #[error("Image error: {message}")]
    #[diagnostic(code(vessel::image))]
    Image {
        /// The error message.
        message: String,
    },

    /// Credential swap or privilege elevation failed.
    ///
    /// Never continue with mismatched credentials after this one.
    #[error("Privilege error: {operation}")]
    #[diagnostic(
        code(vessel::privilege),
        help("The engine expects to start with effective UID 0 (setuid) or inside a user namespace")
    )]
    Priv {
        /// The credential operation that failed.
        operation: String,
    },

    /// mount(2) failed on a required destination.
    #[error("Mount error: {message}")]
    #[diagnostic(code(vessel::mount))]
    Mount {
        /// The error message.
        message: String,
    },

    /// Transport error from the privileged RPC helper.
    #[error("RPC error: {message}")]
    #[diagnostic(code(vessel::rpc))]
    Rpc {
        /// The error message.
        message: String,
    },

    /// Loop device allocation or configuration failed.
    #[error("Loop device error: {message}")]
    #[diagnostic(code(vessel::loopdev))]
    Loop {
        /// The error message.
        message: String,
    },

    /// The session directory could not be created or staged.
    #[error("Session error: {message}")]
    #[diagnostic(code(vessel::session))]
    Session {
        /// The error message.
        message: String,
    },

    /// A mount option token could not be parsed.
    #[error("Invalid mount option: {option}")]
    #[diagnostic(
        code(vessel::invalid_option),
        help("Internal options take the form offset=<bytes> or sizelimit=<bytes>")
    )]
    InvalidOption {
        /// The offending option token.
        option: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(vessel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(vessel::serialization))]
    Serialization(String),
}

impl VesselError {
    /// Build a [`VesselError::Config`] from anything displayable.
    pub fn config(message: impl std::fmt::Display) -> Self {
        VesselError::Config {
            message: message.to_string(),
        }
    }

    /// Build a [`VesselError::Image`] from anything displayable.
    pub fn image(message: impl std::fmt::Display) -> Self {
        VesselError::Image {
            message: message.to_string(),
        }
    }

    /// Build a [`VesselError::Mount`] from anything displayable.
    pub fn mount(message: impl std::fmt::Display) -> Self {
        VesselError::Mount {
            message: message.to_string(),
        }
    }

    /// Build a [`VesselError::Session`] from anything displayable.
    pub fn session(message: impl std::fmt::Display) -> Self {
        VesselError::Session {
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> Self {
        VesselError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VesselError::Mount {
            message: "destination /mnt doesn't exist".to_string(),
        };
        assert_eq!(err.to_string(), "Mount error: destination /mnt doesn't exist");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VesselError = io_err.into();
        assert!(matches!(err, VesselError::Io(_)));
    }

    #[test]
    fn invalid_option_names_token() {
        let err = VesselError::InvalidOption {
            option: "offset=zero".to_string(),
        };
        assert!(err.to_string().contains("offset=zero"));
    }
}
