//! Global configuration model for the Burrow runtime.
//!
//! The configuration is a JSON document at `<topdir>/burrow.json`. Every
//! field is optional in the file; missing fields take the defaults below.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};
use crate::types::ExecMode;

/// How a helper executable (runtime or emulator) is located.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutableSource {
    /// Search `$PATH`, then fall back to the bundled binaries.
    #[default]
    Search,
    /// Only use the architecture-specific binaries in `<topdir>/bin`.
    Bundled,
    /// Use this executable.
    Path(PathBuf),
}

impl From<String> for ExecutableSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "search" => Self::Search,
            "bundled" => Self::Bundled,
            _ => Self::Path(PathBuf::from(value)),
        }
    }
}

impl From<ExecutableSource> for String {
    fn from(value: ExecutableSource) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ExecutableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Search => f.write_str("search"),
            Self::Bundled => f.write_str("bundled"),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Root configuration for the Burrow runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    /// Base directory for containers and bundled binaries.
    pub topdir: PathBuf,
    /// Scratch directory for temporary files.
    pub tmpdir: PathBuf,
    /// Location of the namespace runtime (runc/crun).
    pub runtime: ExecutableSource,
    /// Location of the syscall-emulation engine (proot).
    pub emulator: ExecutableSource,
    /// Capabilities granted to the container process; empty keeps the spec's.
    pub runtime_capabilities: Vec<String>,
    /// Drop the message-queue mount: `Some` forces, `None` decides by kernel version.
    pub no_mqueue: Option<bool>,
    /// Oldest kernel that supports the message-queue mount in user namespaces.
    pub mqueue_min_kernel: String,
    /// Host system files always made visible inside the container.
    pub sysdirs: Vec<PathBuf>,
    /// Container directories under which single host files may be bound.
    pub mountpoint_prefixes: Vec<PathBuf>,
    /// CPU affinity wrappers, tried in order; `%s` is replaced by the cpuset.
    pub cpu_affinity_tools: Vec<Vec<String>>,
    /// Size option applied to the shared-memory mount.
    pub shm_size: String,
    /// Execution mode used by containers without a recorded mode.
    pub default_execmode: ExecMode,
    /// Always disable emulator seccomp acceleration.
    pub emulator_no_seccomp: bool,
    /// `PATH` given to the container process when none is set.
    pub root_path: String,
    /// Host variables kept when starting from a clean environment.
    pub valid_host_env: Vec<String>,
    /// Host variables never exported, even with `--hostenv`.
    pub invalid_host_env: Vec<String>,
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            topdir: crate::constants::default_topdir(),
            tmpdir: crate::constants::default_tmpdir(),
            runtime: ExecutableSource::Search,
            emulator: ExecutableSource::Search,
            runtime_capabilities: Vec::new(),
            no_mqueue: None,
            mqueue_min_kernel: "4.8.0".into(),
            sysdirs: vec!["/etc/resolv.conf".into(), "/etc/host.conf".into()],
            mountpoint_prefixes: vec!["/etc".into(), "/dev".into(), "/proc".into(), "/sys".into()],
            cpu_affinity_tools: vec![
                vec!["numactl".into(), "-C".into(), "%s".into(), "--".into()],
                vec!["taskset".into(), "-c".into(), "%s".into()],
            ],
            shm_size: "2g".into(),
            default_execmode: ExecMode::P1,
            emulator_no_seccomp: false,
            root_path: "/usr/sbin:/sbin:/usr/bin:/bin".into(),
            valid_host_env: vec!["TERM".into()],
            invalid_host_env: vec![
                "VTE_VERSION".into(),
                "LD_PRELOAD".into(),
                "LD_LIBRARY_PATH".into(),
            ],
        }
    }
}

impl BurrowConfig {
    /// Loads the configuration file, falling back to defaults when it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| BurrowError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| BurrowError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Returns the directory holding container bundles.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.topdir.join(crate::constants::CONTAINERS_DIR)
    }

    /// Returns the directory holding bundled helper binaries.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.topdir.join(crate::constants::BIN_DIR)
    }
}
