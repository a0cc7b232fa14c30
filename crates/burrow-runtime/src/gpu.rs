//! NVIDIA GPU passthrough marker and device discovery.

use std::fs;
use std::path::{Path, PathBuf};

use burrow_common::constants::GPU_MARKER_FILE;
use burrow_common::error::{BurrowError, Result};

/// Control device whose explicit request disables auto-discovery.
pub const CONTROL_DEVICE: &str = "/dev/nvidiactl";

/// Returns `true` if GPU passthrough is enabled for the container.
#[must_use]
pub fn is_enabled(container_dir: &Path) -> bool {
    container_dir.join(GPU_MARKER_FILE).exists()
}

/// Enables or disables GPU passthrough for the container.
///
/// # Errors
///
/// Returns an error if the marker file cannot be written or removed.
pub fn set_enabled(container_dir: &Path, enabled: bool) -> Result<()> {
    let marker = container_dir.join(GPU_MARKER_FILE);
    let outcome = if enabled {
        fs::write(&marker, "")
    } else {
        match fs::remove_file(&marker) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    };
    outcome.map_err(|e| BurrowError::io(&marker, e))?;
    tracing::debug!(dir = %container_dir.display(), enabled, "gpu passthrough");
    Ok(())
}

/// Lists the `nvidia*` device nodes under `dev_dir`, sorted.
#[must_use]
pub fn devices_in(dev_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dev_dir) else {
        return Vec::new();
    };
    let mut devices: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("nvidia"))
        .map(|e| e.path())
        .filter(|p| !p.is_dir())
        .collect();
    devices.sort();
    devices
}

/// Lists the host's NVIDIA device nodes.
#[must_use]
pub fn devices() -> Vec<PathBuf> {
    devices_in(Path::new("/dev"))
}
