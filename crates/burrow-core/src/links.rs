//! Absolute symlink translation between container- and host-rooted forms.
//!
//! Images are full of absolute symlinks (`/usr/lib/libfoo.so -> /lib/...`)
//! that only make sense relative to the container root. Engines that do not
//! change root need them prefixed with the host location of `ROOT`; engines
//! that do need them back in their original form.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use burrow_common::error::{BurrowError, Result};
use regex::Regex;
use walkdir::WalkDir;

use crate::fileops::FileHandle;
use crate::guard::SafePrefixSet;

/// Matches a host-rooted target inside any container's `ROOT` directory.
static CONTAINER_ROOT_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/.*/containers/[^/]+/ROOT)(/.*)?$").expect("container root regex is valid")
});

/// Rewrites absolute symlinks owned by a single user under a guarded tree.
#[derive(Debug)]
pub struct LinkTranslator<'g> {
    guard: &'g SafePrefixSet,
    owner: u32,
}

impl<'g> LinkTranslator<'g> {
    /// Creates a translator that only touches links owned by `owner`.
    #[must_use]
    pub const fn new(guard: &'g SafePrefixSet, owner: u32) -> Self {
        Self { guard, owner }
    }

    /// Prefixes the target of `link` with `new_root`.
    ///
    /// A target already rooted at `orig_root` (or, when that is empty, at any
    /// container `ROOT`) has that root swapped for `new_root`. Relative links
    /// and targets already under `new_root` are left alone.
    ///
    /// Returns `true` if the link was rewritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is not owned by the translator's user or
    /// cannot be replaced.
    pub fn convert(&self, link: &Path, orig_root: &Path, new_root: &Path, force: bool) -> Result<bool> {
        let target = fs::read_link(link).map_err(|e| BurrowError::io(link, e))?;
        if !target.is_absolute() {
            return Ok(false);
        }
        let known_root = if orig_root.as_os_str().is_empty() {
            container_root_of(&target).map(|(root, _)| root)
        } else {
            Some(orig_root.to_path_buf())
        };
        let new_target = match known_root {
            Some(root) if root != new_root && target.starts_with(&root) => {
                let rest = target.strip_prefix(&root).unwrap_or(Path::new(""));
                new_root.join(rest)
            }
            _ if !target.starts_with(new_root) => {
                new_root.join(target.strip_prefix("/").unwrap_or(target.as_path()))
            }
            _ => return Ok(false),
        };
        self.replace(link, &new_target, force)?;
        Ok(true)
    }

    /// Strips the host-side root from the target of `link`.
    ///
    /// `orig_root` is tried first, then `target_root`; when `orig_root` is
    /// empty any container `ROOT` prefix is stripped as well.
    ///
    /// Returns `true` if the link was rewritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is not owned by the translator's user or
    /// cannot be replaced.
    pub fn restore(
        &self,
        link: &Path,
        orig_root: &Path,
        target_root: &Path,
        force: bool,
    ) -> Result<bool> {
        let target = fs::read_link(link).map_err(|e| BurrowError::io(link, e))?;
        let stripped = if !orig_root.as_os_str().is_empty() && target.starts_with(orig_root) {
            target.strip_prefix(orig_root).ok().map(Path::to_path_buf)
        } else if target.starts_with(target_root) {
            target.strip_prefix(target_root).ok().map(Path::to_path_buf)
        } else if orig_root.as_os_str().is_empty() {
            container_root_of(&target).map(|(_, rest)| rest)
        } else {
            None
        };
        let Some(rest) = stripped else {
            return Ok(false);
        };
        let new_target = Path::new("/").join(rest);
        self.replace(link, &new_target, force)?;
        Ok(true)
    }

    /// Converts (`into_context`) or restores every eligible link under `root`.
    ///
    /// Returns the links that were changed. Nothing is done when `root` is
    /// not inside a safe prefix. Failures on single links are logged and
    /// skipped.
    pub fn links_conv(&self, root: &Path, into_context: bool, orig_root: &Path, force: bool) -> Vec<PathBuf> {
        if !self.guard.is_safe(root) {
            tracing::warn!(root = %root.display(), "links conversion refused on unsafe path");
            return Vec::new();
        }
        let mut changed = Vec::new();
        for link in self.candidates(root) {
            let outcome = if into_context {
                self.convert(&link, orig_root, root, force)
            } else {
                self.restore(&link, orig_root, root, force)
            };
            match outcome {
                Ok(true) => changed.push(link),
                Ok(false) => {}
                Err(e) => tracing::warn!(link = %link.display(), error = %e, "link not converted"),
            }
        }
        tracing::debug!(root = %root.display(), into_context, changed = changed.len(), "links converted");
        changed
    }

    fn candidates(&self, root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .follow_links(false)
            .follow_root_links(false)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path_is_symlink())
            .filter(|e| e.metadata().is_ok_and(|m| m.uid() == self.owner))
            .map(walkdir::DirEntry::into_path)
            .collect()
    }

    fn replace(&self, link: &Path, new_target: &Path, force: bool) -> Result<()> {
        let meta = fs::symlink_metadata(link).map_err(|e| BurrowError::io(link, e))?;
        if meta.uid() != self.owner {
            return Err(BurrowError::PermissionDenied {
                message: format!("link not owned by user: {}", link.display()),
            });
        }
        let parent = link.parent().unwrap_or(Path::new("/"));
        let restore_mode = if force { make_writable(parent) } else { None };
        let result = FileHandle::new(link, self.guard)
            .remove(false, false)
            .and_then(|()| {
                std::os::unix::fs::symlink(new_target, link).map_err(|e| BurrowError::io(link, e))
            });
        if let Some(mode) = restore_mode {
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(mode));
        }
        result?;
        tracing::debug!(link = %link.display(), target = %new_target.display(), "link rewritten");
        Ok(())
    }
}

/// Splits a target into a container `ROOT` and the path inside it.
fn container_root_of(target: &Path) -> Option<(PathBuf, PathBuf)> {
    let target = target.to_str()?;
    let captures = CONTAINER_ROOT_TARGET.captures(target)?;
    let root = PathBuf::from(captures.get(1)?.as_str());
    let rest = captures.get(2).map_or("/", |m| m.as_str());
    Some((root, PathBuf::from(rest.trim_start_matches('/'))))
}

/// Adds owner write permission to `dir`, returning the previous mode if changed.
fn make_writable(dir: &Path) -> Option<u32> {
    let mode = fs::metadata(dir).ok()?.permissions().mode();
    if mode & 0o200 != 0 {
        return None;
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o200)).ok()?;
    Some(mode)
}
