//! Host information: invoking identity, CPU architecture, kernel version.

use std::cmp::Ordering;

/// User and group the tool runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdentity {
    /// Real user ID.
    pub uid: u32,
    /// Real group ID.
    pub gid: u32,
}

impl HostIdentity {
    /// Returns the identity of the current process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Returns the architecture name used for bundled binary lookup.
#[must_use]
pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Returns the machine name used in bundled binary file names
/// (`runc-x86_64`, `proot-arm64`, ...).
#[must_use]
pub fn arch_binary_suffix() -> Option<&'static str> {
    match arch() {
        "amd64" => Some("x86_64"),
        "i386" => Some("x86"),
        "arm64" => Some("arm64"),
        "arm" => Some("arm"),
        _ => None,
    }
}

/// Returns the kernel release string, or an empty string if unavailable.
#[must_use]
pub fn kernel_release() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.release().to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Returns the host's node name, or `localhost` if it cannot be read.
#[must_use]
pub fn node_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Parses the leading numeric components of a version (`5.15.0-91` → `[5, 15, 0]`).
#[must_use]
pub fn parse_version(version: &str) -> Vec<u32> {
    version
        .split(['.', '-'])
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Compares two dotted versions numerically, missing components counting as zero.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let (l, r) = (parse_version(left), parse_version(right));
    let len = l.len().max(r.len());
    (0..len)
        .map(|i| l.get(i).unwrap_or(&0).cmp(r.get(i).unwrap_or(&0)))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Returns `true` if the running kernel is at least `min`.
///
/// An unreadable kernel release is treated as older than any version.
#[must_use]
pub fn kernel_at_least(min: &str) -> bool {
    let release = kernel_release();
    !parse_version(&release).is_empty() && compare_versions(&release, min).is_ge()
}
