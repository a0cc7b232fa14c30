//! Typed OCI runtime spec.
//!
//! Only the fields the runner edits are modelled; everything else the
//! runtime generated is kept in `extra` maps and written back untouched.

pub mod builder;

use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use builder::SpecBuilder;

/// Root of an OCI runtime spec (`config.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Spec format version.
    #[serde(default)]
    pub oci_version: String,
    /// Root filesystem.
    #[serde(default)]
    pub root: Root,
    /// Container process.
    #[serde(default)]
    pub process: Process,
    /// Container hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Mount table, in mount order.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Linux-specific section.
    #[serde(default)]
    pub linux: Linux,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Root filesystem of the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    /// Host path of the root filesystem.
    #[serde(default)]
    pub path: String,
    /// Mount the root read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Process started inside the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Allocate a terminal for the process.
    #[serde(default)]
    pub terminal: bool,
    /// Command and arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub cwd: String,
    /// Capability sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The five Linux capability sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bounding set.
    #[serde(default)]
    pub bounding: Vec<String>,
    /// Effective set.
    #[serde(default)]
    pub effective: Vec<String>,
    /// Inheritable set.
    #[serde(default)]
    pub inheritable: Vec<String>,
    /// Permitted set.
    #[serde(default)]
    pub permitted: Vec<String>,
    /// Ambient set.
    #[serde(default)]
    pub ambient: Vec<String>,
}

/// One mount, identified by its `(source, destination)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Path inside the container.
    pub destination: String,
    /// Filesystem type.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Host path or pseudo-filesystem name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Mount {
    /// Builds a recursive bind mount of `source` at `destination`.
    #[must_use]
    pub fn bind(source: &str, destination: &str, writable: bool) -> Self {
        Self {
            destination: destination.to_owned(),
            kind: "none".to_owned(),
            source: source.to_owned(),
            options: ["rbind", "nosuid", "nodev", if writable { "rw" } else { "ro" }]
                .map(str::to_owned)
                .to_vec(),
            extra: Map::new(),
        }
    }
}

/// Linux-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// User ID mappings for the user namespace.
    #[serde(default)]
    pub uid_mappings: Vec<IdMapping>,
    /// Group ID mappings for the user namespace.
    #[serde(default)]
    pub gid_mappings: Vec<IdMapping>,
    /// Device nodes created in the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One contiguous ID range mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First ID inside the container.
    #[serde(rename = "containerID")]
    pub container_id: u32,
    /// First ID on the host.
    #[serde(rename = "hostID")]
    pub host_id: u32,
    /// Length of the range.
    pub size: u32,
}

/// A device node exposed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Path inside the container.
    pub path: String,
    /// `b` for block or `c` for character devices.
    #[serde(rename = "type")]
    pub kind: String,
    /// Major device number.
    pub major: u64,
    /// Minor device number.
    pub minor: u64,
    /// Permission bits of the node.
    pub file_mode: u32,
    /// Owner of the node.
    pub uid: u32,
    /// Group of the node.
    pub gid: u32,
}

impl RuntimeSpec {
    /// Parses and validates a spec document.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(json).map_err(|e| BurrowError::Spec {
            message: e.to_string(),
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reads and validates the spec at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| BurrowError::io(path, e))?;
        let spec = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), mounts = spec.mounts.len(), "spec loaded");
        Ok(spec)
    }

    /// Validates and writes the spec to `path` as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| BurrowError::io(path, e))?;
        tracing::debug!(path = %path.display(), "spec saved");
        Ok(())
    }

    /// Serializes the spec as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks the structural rules a runtime would reject the spec for.
    ///
    /// # Errors
    ///
    /// Returns a [`BurrowError::Spec`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(BurrowError::Spec { message });
        if self.oci_version.is_empty() {
            return invalid("missing ociVersion".into());
        }
        if self.root.path.is_empty() {
            return invalid("missing root.path".into());
        }
        if !self.process.cwd.is_empty() && !self.process.cwd.starts_with('/') {
            return invalid(format!("process.cwd must be absolute: {}", self.process.cwd));
        }
        if let Some(mount) = self.mounts.iter().find(|m| !m.destination.starts_with('/')) {
            return invalid(format!("mount destination must be absolute: {}", mount.destination));
        }
        if let Some(dev) = self.linux.devices.iter().find(|d| !matches!(d.kind.as_str(), "b" | "c" | "u" | "p")) {
            return invalid(format!("invalid type {:?} for device {}", dev.kind, dev.path));
        }
        Ok(())
    }

    /// Appends a mount.
    pub fn add_mount(&mut self, mount: Mount) {
        self.mounts.push(mount);
    }

    /// Returns the index of the mount with exactly this source and destination.
    #[must_use]
    pub fn select_mount(&self, source: &str, destination: &str) -> Option<usize> {
        self.mounts
            .iter()
            .position(|m| m.source == source && m.destination == destination)
    }

    /// Removes the mount with this source and destination; `false` if absent.
    pub fn del_mount(&mut self, source: &str, destination: &str) -> bool {
        let Some(index) = self.select_mount(source, destination) else {
            return false;
        };
        let _ = self.mounts.remove(index);
        true
    }

    /// Merges `options` into the matching mount's options.
    ///
    /// Existing options sharing a key (text before `=`) with a new option are
    /// dropped first. Returns `false` when no mount matches.
    pub fn modify_mount(&mut self, source: &str, destination: &str, options: &[String]) -> bool {
        let Some(index) = self.select_mount(source, destination) else {
            return false;
        };
        let mount = &mut self.mounts[index];
        for option in options {
            let key = option_key(option);
            mount.options.retain(|existing| option_key(existing) != key);
        }
        mount.options.extend(options.iter().cloned());
        true
    }
}

fn option_key(option: &str) -> &str {
    option.split_once('=').map_or(option, |(key, _)| key)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const GENERATED: &str = r#"{
        "ociVersion": "1.0.2-dev",
        "process": {
            "terminal": true,
            "user": {"uid": 0, "gid": 0},
            "args": ["sh"],
            "env": ["PATH=/usr/bin:/bin", "TERM=xterm"],
            "cwd": "/",
            "capabilities": {"bounding": ["CAP_KILL"], "effective": ["CAP_KILL"], "permitted": ["CAP_KILL"]},
            "noNewPrivileges": true
        },
        "root": {"path": "rootfs", "readonly": true},
        "hostname": "runc",
        "mounts": [
            {"destination": "/proc", "type": "proc", "source": "proc"},
            {"destination": "/dev/shm", "type": "tmpfs", "source": "shm",
             "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]},
            {"destination": "/dev/mqueue", "type": "mqueue", "source": "mqueue",
             "options": ["nosuid", "noexec", "nodev"]}
        ],
        "linux": {
            "uidMappings": [{"containerID": 0, "hostID": 1000, "size": 1}],
            "gidMappings": [{"containerID": 0, "hostID": 1000, "size": 1}],
            "namespaces": [{"type": "pid"}, {"type": "user"}],
            "maskedPaths": ["/proc/kcore"]
        }
    }"#;

    #[test]
    fn unknown_fields_survive_a_roundtrip() {
        let spec = RuntimeSpec::from_json(GENERATED).expect("parse");
        assert!(spec.linux.extra.contains_key("namespaces"));
        assert!(spec.process.extra.contains_key("noNewPrivileges"));
        let again = RuntimeSpec::from_json(&spec.to_json().expect("json")).expect("reparse");
        assert_eq!(again, spec);
    }

    #[test]
    fn validation_rejects_relative_mount_destinations() {
        let mut spec = RuntimeSpec::from_json(GENERATED).expect("parse");
        spec.add_mount(Mount::bind("/srv", "srv", true));
        assert!(matches!(spec.validate(), Err(BurrowError::Spec { .. })));
    }

    #[test]
    fn validation_requires_version_and_root() {
        assert!(RuntimeSpec::from_json("{}").is_err());
        assert!(RuntimeSpec::from_json(r#"{"ociVersion": "1.0.0"}"#).is_err());
        assert!(RuntimeSpec::from_json("not json").is_err());
    }

    #[test]
    fn mount_modification_needs_exact_pair() {
        let mut spec = RuntimeSpec::from_json(GENERATED).expect("parse");
        let size = vec!["size=2g".to_owned()];
        assert!(!spec.modify_mount("tmpfs", "/dev/shm", &size));
        assert!(!spec.modify_mount("shm", "/shm", &size));
        assert!(spec.modify_mount("shm", "/dev/shm", &size));

        let shm = &spec.mounts[1];
        assert!(shm.options.contains(&"size=2g".to_owned()));
        assert!(!shm.options.iter().any(|o| o == "size=65536k"));
        assert!(shm.options.contains(&"mode=1777".to_owned()));
    }

    #[test]
    fn first_mount_can_be_selected_and_deleted() {
        let mut spec = RuntimeSpec::from_json(GENERATED).expect("parse");
        assert_eq!(spec.select_mount("proc", "/proc"), Some(0));
        assert!(spec.del_mount("proc", "/proc"));
        assert_eq!(spec.select_mount("proc", "/proc"), None);
        assert!(!spec.del_mount("proc", "/proc"));
    }

    #[test]
    fn bind_mounts_carry_the_access_mode() {
        let mount = Mount::bind("/data", "/mnt", false);
        assert_eq!(mount.kind, "none");
        assert_eq!(mount.options, ["rbind", "nosuid", "nodev", "ro"]);
    }
}
