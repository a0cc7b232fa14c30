//! Mapping of container paths onto the host filesystem.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use burrow_common::types::VolumeBind;

use crate::guard::normalize;

/// Maps a container-side absolute path to where it lives on the host.
///
/// A volume whose container side covers `path` wins; otherwise the path is
/// resolved under `container_root`, with absolute symlinks re-rooted in the
/// container. Returns an empty path for empty or relative input.
#[must_use]
pub fn cont2host(path: &Path, container_root: &Path, volumes: &[VolumeBind]) -> PathBuf {
    if !path.is_absolute() {
        return PathBuf::new();
    }
    if let Some(volume) = volumes.iter().find(|v| v.covers(path)) {
        let rest = path.strip_prefix(&volume.container).unwrap_or(Path::new(""));
        return normalize(&volume.host.join(rest));
    }
    let mut host = container_root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => host.push(part),
            Component::ParentDir => {
                if host != container_root {
                    let _ = host.pop();
                }
                continue;
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => continue,
        }
        host = follow_link(host, container_root);
    }
    normalize(&host)
}

/// Follows one level of symlink at `host`, clamped to `container_root`.
fn follow_link(host: PathBuf, container_root: &Path) -> PathBuf {
    let Ok(target) = fs::read_link(&host) else {
        return host;
    };
    let followed = if target.is_absolute() {
        container_root.join(target.strip_prefix("/").unwrap_or(target.as_path()))
    } else {
        let parent = host.parent().map_or_else(|| container_root.to_path_buf(), Path::to_path_buf);
        parent.join(target)
    };
    let followed = normalize(&followed);
    if followed.starts_with(container_root) {
        followed
    } else {
        container_root.to_path_buf()
    }
}

/// Finds `name` in `search_list`, returning the host path of the first
/// regular, executable match.
///
/// Entries of `.` stand for `workdir`. Names containing `/` are checked as
/// given. An empty list or no match yields an empty path.
#[must_use]
pub fn find_exec(
    name: &str,
    search_list: &[String],
    container_root: &Path,
    volumes: &[VolumeBind],
    workdir: &Path,
) -> PathBuf {
    if name.is_empty() {
        return PathBuf::new();
    }
    let resolve = |candidate: &Path| -> PathBuf {
        if container_root.as_os_str().is_empty() {
            candidate.to_path_buf()
        } else {
            cont2host(candidate, container_root, volumes)
        }
    };
    if name.contains('/') {
        let candidate = if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            workdir.join(name)
        };
        let host = resolve(&candidate);
        return if is_executable(&host) { host } else { PathBuf::new() };
    }
    search_list
        .iter()
        .filter(|dir| !dir.is_empty())
        .map(|dir| {
            let dir = if dir == "." { workdir.to_path_buf() } else { PathBuf::from(dir) };
            resolve(&dir.join(name))
        })
        .find(|host| is_executable(host))
        .unwrap_or_default()
}

/// Returns the first `dir/name` that exists, or an empty path.
#[must_use]
pub fn find_file_in_dir(dir: &Path, names: &[String]) -> PathBuf {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.exists())
        .unwrap_or_default()
}

fn is_executable(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}
