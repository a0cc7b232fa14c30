//! Guarded filesystem operations on a single target path.
//!
//! A [`FileHandle`] pairs a target with the shared [`SafePrefixSet`] and
//! keeps a private list of the temporary files it created. Destructive
//! operations refuse to act outside the safe prefixes.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use burrow_common::error::{BurrowError, Result};
use walkdir::WalkDir;

use crate::guard::{self, SafePrefixSet};
use crate::host::HostIdentity;

/// Filesystem operations on one target, gated by a [`SafePrefixSet`].
#[derive(Debug)]
pub struct FileHandle<'g> {
    path: PathBuf,
    guard: &'g SafePrefixSet,
    tmp_trash: Vec<PathBuf>,
}

impl<'g> FileHandle<'g> {
    /// Creates a handle for `path`, made absolute and normalized.
    ///
    /// `-` is kept verbatim as the conventional stdin/stdout marker.
    #[must_use]
    pub fn new(path: impl AsRef<Path>, guard: &'g SafePrefixSet) -> Self {
        let path = path.as_ref();
        let path = if path == Path::new("-") {
            path.to_path_buf()
        } else {
            guard::absolute(path)
        };
        Self {
            path,
            guard,
            tmp_trash: Vec::new(),
        }
    }

    /// Returns the target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers the target itself as a safe prefix.
    pub fn register_prefix(&self) {
        self.guard.register(&self.path);
    }

    /// Returns the owner of the target (not following symlinks).
    #[must_use]
    pub fn uid(&self) -> Option<u32> {
        fs::symlink_metadata(&self.path).ok().map(|m| m.uid())
    }

    /// Returns the size of the target, or `None` if it cannot be stat'ed.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    /// Returns `true` if the target exists (symlinks are not followed).
    #[must_use]
    pub fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).is_ok()
    }

    /// Removes the target.
    ///
    /// Directories need `recursive` unless empty. A missing target is not an
    /// error. `force` skips the containment check, but only for a single
    /// non-directory removed non-recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too short, not owned by the caller,
    /// outside every safe prefix, or the removal itself fails.
    pub fn remove(&mut self, force: bool, recursive: bool) -> Result<()> {
        let Ok(meta) = fs::symlink_metadata(&self.path) else {
            self.forget_tmp();
            return Ok(());
        };
        if self.path.components().count() < 3 {
            return Err(BurrowError::PermissionDenied {
                message: format!("delete pathname too short: {}", self.path.display()),
            });
        }
        if meta.uid() != HostIdentity::current().uid {
            return Err(BurrowError::PermissionDenied {
                message: format!("delete not owner: {}", self.path.display()),
            });
        }
        let is_dir = meta.is_dir();
        let bypass = force && !recursive && !is_dir;
        if !bypass {
            self.ensure_safe("delete")?;
        }
        let outcome = if !is_dir {
            fs::remove_file(&self.path)
        } else if recursive {
            make_tree_writable(&self.path);
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_dir(&self.path)
        };
        outcome.map_err(|e| BurrowError::io(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), recursive, "removed");
        self.forget_tmp();
        Ok(())
    }

    /// Creates the target directory and any missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn mkdir(&self) -> Result<()> {
        fs::create_dir_all(&self.path).map_err(|e| BurrowError::io(&self.path, e))
    }

    /// Removes the target if it is an empty directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub fn rmdir(&self) -> Result<()> {
        fs::remove_dir(&self.path).map_err(|e| BurrowError::io(&self.path, e))
    }

    /// Returns a fresh, unused path in `tmpdir` and records it for [`cleanup`](Self::cleanup).
    pub fn mktmp(&mut self, tmpdir: &Path) -> PathBuf {
        let stem = self
            .path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        let tmp = loop {
            let candidate = tmpdir.join(format!("burrow-{stem}-{}", uuid::Uuid::new_v4().simple()));
            if fs::symlink_metadata(&candidate).is_err() {
                break candidate;
            }
        };
        self.tmp_trash.push(tmp.clone());
        tmp
    }

    /// Creates a fresh temporary directory in `tmpdir`, recorded for cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn mktmpdir(&mut self, tmpdir: &Path) -> Result<PathBuf> {
        let dir = self.mktmp(tmpdir);
        fs::create_dir_all(&dir).map_err(|e| BurrowError::io(&dir, e))?;
        Ok(dir)
    }

    /// Returns the temporary paths created and not yet cleaned up.
    #[must_use]
    pub fn tmp_files(&self) -> &[PathBuf] {
        &self.tmp_trash
    }

    /// Removes every temporary path created through this handle.
    ///
    /// Entries that fail to be removed are logged and kept.
    pub fn cleanup(&mut self) {
        let pending = std::mem::take(&mut self.tmp_trash);
        for tmp in pending {
            let mut handle = FileHandle::new(&tmp, self.guard);
            if let Err(e) = handle.remove(false, true) {
                tracing::warn!(path = %tmp.display(), error = %e, "temporary file not removed");
                self.tmp_trash.push(tmp);
            }
        }
    }

    /// Changes ownership without following symlinks.
    ///
    /// # Errors
    ///
    /// Returns an error if a recursive change targets an unsafe path or any
    /// `lchown` fails.
    pub fn chown(&self, uid: u32, gid: u32, recursive: bool) -> Result<()> {
        if !recursive {
            return lchown(&self.path, uid, gid);
        }
        self.ensure_safe("chown")?;
        for entry in walk(&self.path) {
            lchown(&entry, uid, gid)?;
        }
        Ok(())
    }

    /// Sets permission bits: `file_mode` on files, `dir_mode` on directories.
    /// Symlinks are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a recursive change targets an unsafe path or any
    /// `chmod` fails.
    pub fn chmod(&self, file_mode: u32, dir_mode: u32, recursive: bool) -> Result<()> {
        if recursive {
            self.ensure_safe("chmod")?;
            for entry in walk(&self.path) {
                chmod_entry(&entry, file_mode, dir_mode)?;
            }
            Ok(())
        } else {
            chmod_entry(&self.path, file_mode, dir_mode)
        }
    }

    /// Reads the whole target as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn getdata(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| BurrowError::io(&self.path, e))
    }

    /// Replaces the target's content with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn putdata(&self, data: &str) -> Result<()> {
        fs::write(&self.path, data).map_err(|e| BurrowError::io(&self.path, e))
    }

    /// Copies the target's content to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub fn copyto(&self, dest: &Path) -> Result<()> {
        let _ = fs::copy(&self.path, dest).map_err(|e| BurrowError::io(dest, e))?;
        Ok(())
    }

    fn ensure_safe(&self, operation: &str) -> Result<()> {
        if self.guard.is_safe(&self.path) {
            return Ok(());
        }
        tracing::warn!(path = %self.path.display(), operation, "refused outside of safe prefixes");
        Err(BurrowError::UnsafePath {
            path: self.path.clone(),
        })
    }

    fn forget_tmp(&mut self) {
        self.tmp_trash.retain(|p| p != &self.path);
    }
}

fn walk(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .map(walkdir::DirEntry::into_path)
}

fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|e| BurrowError::io(path, e))
}

fn chmod_entry(path: &Path, file_mode: u32, dir_mode: u32) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| BurrowError::io(path, e))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mode = if meta.is_dir() { dir_mode } else { file_mode };
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| BurrowError::io(path, e))
}

/// Grants the owner rwx on every directory of a tree so it can be emptied.
fn make_tree_writable(root: &Path) {
    for entry in WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_dir())
    {
        if let Ok(meta) = entry.metadata() {
            let mode = meta.permissions().mode() | 0o700;
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode));
        }
    }
}
