//! System-wide constants and default paths.

use std::path::PathBuf;

/// Name of the per-user top directory under `$HOME`.
pub const TOPDIR_NAME: &str = ".burrow";

/// Configuration file looked up inside the top directory.
pub const CONFIG_FILE: &str = "burrow.json";

/// Directory (under the top directory) holding per-container bundles.
pub const CONTAINERS_DIR: &str = "containers";

/// Directory (under the top directory) holding bundled helper binaries.
pub const BIN_DIR: &str = "bin";

/// Name of the container root filesystem directory inside a bundle.
pub const ROOT_DIR: &str = "ROOT";

/// File name of the runtime execution spec inside a bundle.
pub const SPEC_FILE: &str = "config.json";

/// File name of the image metadata inside a bundle.
pub const METADATA_FILE: &str = "container.json";

/// File recording the container's execution mode.
pub const EXECMODE_FILE: &str = "execmode";

/// Marker file enabling GPU device passthrough for a container.
pub const GPU_MARKER_FILE: &str = "gpu";

/// File recording the root that absolute symlinks currently point into.
pub const LINKS_ROOT_FILE: &str = "links.root";

/// Container-side directory where host files are bound.
pub const BIND_HOST_DIR: &str = "/.bind_host_files";

/// Bundle directory preserving container files replaced by bindings.
pub const BIND_ORIG_DIR: &str = ".bind_orig_files";

/// Container-side directory where the emulator binary is exposed.
pub const CONTAINER_HELPER_DIR: &str = "/.burrow/bin";

/// Mount source and destination of the POSIX message-queue mount.
pub const MQUEUE_MOUNT: (&str, &str) = ("mqueue", "/dev/mqueue");

/// Mount source and destination of the shared-memory mount.
pub const SHM_MOUNT: (&str, &str) = ("shm", "/dev/shm");

/// Seconds the streamed supervisor waits for output before re-checking the child.
pub const POLL_INTERVAL_SECS: u16 = 5;

/// Environment variable disabling seccomp acceleration in the emulator.
pub const EMULATOR_NO_SECCOMP_ENV: &str = "PROOT_NO_SECCOMP";

/// Returns the default top directory, `$HOME/.burrow`, or `./.burrow`
/// when no home directory is known.
pub fn default_topdir() -> PathBuf {
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from(TOPDIR_NAME),
        |home| PathBuf::from(home).join(TOPDIR_NAME),
    )
}

/// Returns the default scratch directory, honouring `$TMPDIR`.
pub fn default_tmpdir() -> PathBuf {
    std::env::var_os("TMPDIR").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}
