//! The OCI runtime-spec slice the engine reads.
//!
//! Only two fields matter to construction: the namespace list (user and
//! PID membership change privilege discipline and pseudo-fs choices) and
//! the process working directory. Everything else passes through to the
//! downstream process invocation untouched.

use serde::{Deserialize, Serialize};

/// OCI runtime configuration view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// Container process configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// Process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Working directory inside the container.
    #[serde(default)]
    pub cwd: String,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// Namespaces the container joins or creates.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

/// One namespace membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,

    /// Path of an existing namespace to join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Linux namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

impl Spec {
    /// Whether the namespace list contains `ns_type`.
    #[must_use]
    pub fn has_namespace(&self, ns_type: NamespaceType) -> bool {
        self.linux
            .as_ref()
            .is_some_and(|linux| linux.namespaces.iter().any(|ns| ns.ns_type == ns_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_detection() {
        let spec: Spec = serde_json::from_str(
            r#"{
                "process": {"cwd": "/data"},
                "linux": {"namespaces": [{"type": "mount"}, {"type": "user"}]}
            }"#,
        )
        .unwrap();
        assert!(spec.has_namespace(NamespaceType::User));
        assert!(spec.has_namespace(NamespaceType::Mount));
        assert!(!spec.has_namespace(NamespaceType::Pid));
        assert_eq!(spec.process.unwrap().cwd, "/data");
    }

    #[test]
    fn empty_spec_has_no_namespaces() {
        let spec = Spec::default();
        assert!(!spec.has_namespace(NamespaceType::User));
    }
}
