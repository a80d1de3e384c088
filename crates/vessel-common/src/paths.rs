//! Standard filesystem paths for Vessel.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Base directory under which per-invocation session directories live.
///
/// A build would normally bake this in; the environment override keeps
/// test installations relocatable.
pub static SESSION_BASE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VESSEL_SESSIONDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/vessel/session"))
});

/// System configuration directory.
pub static CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VESSEL_CONFDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/vessel"))
});

/// Mount data string for the session tmpfs, `size=<n>m` when bounded.
#[must_use]
pub fn session_fs_data(size_mb: usize) -> String {
    if size_mb == 0 {
        "mode=1777".to_string()
    } else {
        format!("mode=1777,size={size_mb}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_data_bounded() {
        assert_eq!(session_fs_data(16), "mode=1777,size=16m");
    }

    #[test]
    fn session_data_unbounded() {
        assert_eq!(session_fs_data(0), "mode=1777");
    }
}
