//! Domain primitive types used across the Burrow workspace.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};

/// Identifier of a container bundle in the local store.
///
/// Identifiers become directory names, so separators and dot-only names are
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID after validating it is usable as a directory name.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, `.`/`..`, or contains `/` or NUL.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\0']) {
            return Err(BurrowError::Config {
                message: format!("invalid container id: {id:?}"),
            });
        }
        Ok(Self(id))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution mode of a container.
///
/// `P*` modes run under the syscall-emulation engine, `R*` modes under a
/// namespace-capable runtime. `R2` and `R3` additionally run the emulator
/// inside the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecMode {
    /// Emulation with seccomp acceleration.
    #[default]
    P1,
    /// Emulation without seccomp acceleration.
    P2,
    /// Namespace runtime.
    R1,
    /// Namespace runtime with the emulator overlaid.
    R2,
    /// Namespace runtime with the emulator overlaid, seccomp disabled.
    R3,
}

impl ExecMode {
    /// All modes, in display order.
    pub const ALL: [Self; 5] = [Self::P1, Self::P2, Self::R1, Self::R2, Self::R3];

    /// Returns `true` for modes executed through the namespace runtime.
    #[must_use]
    pub const fn uses_namespaces(self) -> bool {
        matches!(self, Self::R1 | Self::R2 | Self::R3)
    }

    /// Returns `true` when the emulator runs inside the namespace runtime.
    #[must_use]
    pub const fn overlays_emulator(self) -> bool {
        matches!(self, Self::R2 | Self::R3)
    }

    /// Returns `true` when the mode itself disables emulator seccomp acceleration.
    #[must_use]
    pub const fn disables_seccomp(self) -> bool {
        matches!(self, Self::P2 | Self::R3)
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::R3 => "R3",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecMode {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BurrowError::Config {
                message: format!("unknown execution mode: {s}"),
            })
    }
}

/// A `host[:container]` volume binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    /// Host-side path.
    pub host: PathBuf,
    /// Container-side path.
    pub container: PathBuf,
}

impl VolumeBind {
    /// Returns `true` if `path` lies under this binding's container side.
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.container)
    }
}

impl FromStr for VolumeBind {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, container) = s.split_once(':').unwrap_or((s, s));
        let container = if container.is_empty() { host } else { container };
        if !host.starts_with('/') || !container.starts_with('/') {
            return Err(BurrowError::Config {
                message: format!("volume paths must be absolute: {s}"),
            });
        }
        Ok(Self {
            host: PathBuf::from(host),
            container: PathBuf::from(container),
        })
    }
}

/// A `host[:container][:mode]` device request, mode drawn from `r`, `w`, `m`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Host device node.
    pub host: PathBuf,
    /// Path of the node inside the container.
    pub container: PathBuf,
    /// Access mode string.
    pub mode: String,
}

impl DeviceRequest {
    /// Default access mode granting read, write and mknod.
    pub const DEFAULT_MODE: &'static str = "rwm";

    /// Creates a request for `host` exposed at the same path with default mode.
    #[must_use]
    pub fn new(host: impl Into<PathBuf>) -> Self {
        let host = host.into();
        Self {
            container: host.clone(),
            host,
            mode: Self::DEFAULT_MODE.to_owned(),
        }
    }
}

impl FromStr for DeviceRequest {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let host = parts.next().unwrap_or_default();
        if host.is_empty() {
            return Err(BurrowError::Config {
                message: format!("empty device request: {s:?}"),
            });
        }
        let mut request = Self::new(host);
        for part in parts.filter(|p| !p.is_empty()) {
            if part.starts_with('/') {
                request.container = PathBuf::from(part);
            } else if part.chars().all(|c| matches!(c.to_ascii_lowercase(), 'r' | 'w' | 'm')) {
                request.mode = part.to_owned();
            } else {
                return Err(BurrowError::Config {
                    message: format!("invalid device mode in {s:?}"),
                });
            }
        }
        Ok(request)
    }
}

/// Options for a single container run.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Command and arguments; empty means the image default.
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries, or bare `KEY` to import from the host.
    pub env: Vec<String>,
    /// Start from the host environment instead of a clean one.
    pub hostenv: bool,
    /// Volume bindings.
    pub volumes: Vec<VolumeBind>,
    /// Device requests.
    pub devices: Vec<DeviceRequest>,
    /// Container hostname; empty means the host's node name.
    pub hostname: String,
    /// Working directory inside the container.
    pub cwd: String,
    /// Requested user inside the container.
    pub user: String,
    /// CPU set for the affinity wrapper.
    pub cpuset: String,
    /// Mount the root filesystem read-only.
    pub readonly: bool,
    /// Requested port publications (unsupported, warned about).
    pub ports: Vec<String>,
    /// Publish all ports / cooperative networking (unsupported, warned about).
    pub netcoop: bool,
}
