//! Engine configuration.
//!
//! The deserialized form of the administrator configuration plus the
//! per-invocation request. The encoding is the front-end's business;
//! unknown document fields are ignored here, but unrecognized enum values
//! are configuration errors.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vessel_common::{VesselError, VesselResult};

/// Administrator policy for overlayfs use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OverlayMode {
    /// Always use overlay when the kernel supports it.
    Yes,
    /// Use overlay when available, fall back silently.
    Try,
    /// Never use overlay.
    No,
}

impl FromStr for OverlayMode {
    type Err = VesselError;

    fn from_str(s: &str) -> VesselResult<Self> {
        match s {
            "yes" => Ok(OverlayMode::Yes),
            "try" => Ok(OverlayMode::Try),
            "no" => Ok(OverlayMode::No),
            other => Err(VesselError::config(format!(
                "unknown 'enable overlay' value: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for OverlayMode {
    type Error = VesselError;

    fn try_from(value: String) -> VesselResult<Self> {
        value.parse()
    }
}

impl From<OverlayMode> for String {
    fn from(mode: OverlayMode) -> Self {
        match mode {
            OverlayMode::Yes => "yes".to_string(),
            OverlayMode::Try => "try".to_string(),
            OverlayMode::No => "no".to_string(),
        }
    }
}

/// Administrator policy for the container `/dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevMode {
    /// Build a minimal staged `/dev`.
    Minimal,
    /// Bind the host `/dev`.
    Yes,
    /// Mount no `/dev` at all.
    No,
}

impl FromStr for DevMode {
    type Err = VesselError;

    fn from_str(s: &str) -> VesselResult<Self> {
        match s {
            "minimal" => Ok(DevMode::Minimal),
            "yes" => Ok(DevMode::Yes),
            "no" => Ok(DevMode::No),
            other => Err(VesselError::config(format!(
                "unknown 'mount dev' value: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for DevMode {
    type Error = VesselError;

    fn try_from(value: String) -> VesselResult<Self> {
        value.parse()
    }
}

impl From<DevMode> for String {
    fn from(mode: DevMode) -> Self {
        match mode {
            DevMode::Minimal => "minimal".to_string(),
            DevMode::Yes => "yes".to_string(),
            DevMode::No => "no".to_string(),
        }
    }
}

/// Everything the construction engine consumes for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Root filesystem image path.
    pub image_path: String,
    /// Open the rootfs image writable.
    pub writable_image: bool,
    /// Overlay image requests, `<path>[:ro]`.
    pub overlay_images: Vec<String>,
    /// Do not mount the user's home.
    pub no_home: bool,
    /// Minimal-contamination mode: no admin binds, staged tmp, no cwd.
    pub contain: bool,
    /// Working directory supplying tmp/scratch sources under `contain`.
    pub workdir: Option<String>,
    /// Scratch directory requests.
    pub scratch_dirs: Vec<String>,
    /// Home request, `<src>[:<dst>]`; empty means the passwd entry home.
    pub home_spec: String,
    /// Per-invocation user bind requests, `<src>[:<dst>[:ro|rw]]`.
    pub bind_path: Vec<String>,
    /// Bind NVIDIA device nodes into the container.
    pub nv_gpu: bool,

    /// Allow sandbox (directory) containers.
    pub allow_container_dir: bool,
    /// Allow extfs image containers.
    pub allow_container_extfs: bool,
    /// Allow squashfs image containers.
    pub allow_container_squashfs: bool,
    /// Restrict container images to these path prefixes.
    pub limit_container_paths: Vec<String>,
    /// Restrict container images to these owning GIDs.
    pub limit_container_groups: Vec<u32>,
    /// Restrict container images to these owning UIDs.
    pub limit_container_owners: Vec<u32>,

    /// Overlay policy.
    pub enable_overlay: OverlayMode,
    /// Whether the underlay fallback is allowed.
    pub enable_underlay: bool,

    /// Mount `/proc`.
    pub mount_proc: bool,
    /// Mount `/sys`.
    pub mount_sys: bool,
    /// `/dev` policy.
    pub mount_dev: DevMode,
    /// Mount a private devpts instance in minimal `/dev`.
    pub mount_devpts: bool,
    /// Mount the user's home.
    pub mount_home: bool,
    /// Mount `/tmp` and `/var/tmp`.
    pub mount_tmp: bool,
    /// Bind host filesystems from the root mount.
    pub mount_hostfs: bool,
    /// Administrator bind specifications, `<src>[:<dst>]`.
    pub global_bind_path: Vec<String>,

    /// Synthesize `/etc/passwd`.
    pub config_passwd: bool,
    /// Synthesize `/etc/group`.
    pub config_group: bool,
    /// Whether users may request their own binds.
    pub user_bind_control: bool,

    /// Filesystem type of the session staging area.
    pub session_fs_type: String,
    /// Session size bound in MiB for unprivileged invocations.
    pub session_max_size: usize,
    /// Filesystem type for in-memory mounts such as `/dev/shm`.
    pub memory_fs_type: String,
    /// Override of the built-in session base directory.
    pub sessiondir_prefix: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image_path: String::new(),
            writable_image: false,
            overlay_images: Vec::new(),
            no_home: false,
            contain: false,
            workdir: None,
            scratch_dirs: Vec::new(),
            home_spec: String::new(),
            bind_path: Vec::new(),
            nv_gpu: false,
            allow_container_dir: true,
            allow_container_extfs: true,
            allow_container_squashfs: true,
            limit_container_paths: Vec::new(),
            limit_container_groups: Vec::new(),
            limit_container_owners: Vec::new(),
            enable_overlay: OverlayMode::Try,
            enable_underlay: true,
            mount_proc: true,
            mount_sys: true,
            mount_dev: DevMode::Minimal,
            mount_devpts: true,
            mount_home: true,
            mount_tmp: true,
            mount_hostfs: false,
            global_bind_path: Vec::new(),
            config_passwd: true,
            config_group: true,
            user_bind_control: true,
            session_fs_type: "tmpfs".to_string(),
            session_max_size: 16,
            memory_fs_type: "tmpfs".to_string(),
            sessiondir_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_parse() {
        assert_eq!("try".parse::<OverlayMode>().unwrap(), OverlayMode::Try);
        assert_eq!("minimal".parse::<DevMode>().unwrap(), DevMode::Minimal);
    }

    #[test]
    fn unknown_enum_value_is_config_error() {
        let err = "sometimes".parse::<OverlayMode>().unwrap_err();
        assert!(matches!(err, VesselError::Config { .. }));
        assert!("full".parse::<DevMode>().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"image-path": "/images/a.sif", "unknown-field": 1}"#).unwrap();
        assert_eq!(config.image_path, "/images/a.sif");
        assert!(config.mount_proc);
        assert_eq!(config.enable_overlay, OverlayMode::Try);
    }

    #[test]
    fn rejects_bad_enum_in_document() {
        let result: Result<EngineConfig, _> =
            serde_json::from_str(r#"{"mount-dev": "occasionally"}"#);
        assert!(result.is_err());
    }
}
