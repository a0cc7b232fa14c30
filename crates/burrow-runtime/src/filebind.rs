//! Per-run host copies of single files bound into the container.
//!
//! Runtimes can only bind directories reliably, so single files (resolver
//! configuration, the emulator binary) are copied into a private host
//! directory that is mounted at `/.bind_host_files`. The container-side file
//! is replaced by a symlink into that mount and the original is kept under
//! `<container_dir>/.bind_orig_files` so it can be restored.

use std::fs;
use std::path::{Path, PathBuf};

use burrow_common::constants::{BIND_HOST_DIR, BIND_ORIG_DIR};
use burrow_common::error::{BurrowError, Result};
use burrow_core::fileops::FileHandle;
use burrow_core::guard::SafePrefixSet;

/// Collaborator that exposes single host files inside the container.
pub trait FileBinding {
    /// Creates the host directory and fills it with `system_files`.
    ///
    /// Returns `(host_dir, container_dir)` for the bind mount.
    ///
    /// # Errors
    ///
    /// Returns an error if the host directory cannot be created.
    fn start(&mut self, system_files: &[PathBuf]) -> Result<(PathBuf, PathBuf)>;

    /// Replaces the container file `cont_file` by a link into the bind mount.
    ///
    /// # Errors
    ///
    /// Returns an error if the container file cannot be moved or linked.
    fn set_file(&mut self, host_file: &Path, cont_file: &Path) -> Result<()>;

    /// Copies `host_file` into the host directory under `cont_file`'s name.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails or the binding is not started.
    fn add_file(&mut self, host_file: &Path, cont_file: &Path) -> Result<()>;

    /// Returns the host path backing `cont_file`.
    fn get_path(&self, cont_file: &Path) -> PathBuf;

    /// Releases the host directory. Safe to call more than once.
    fn finish(&mut self);
}

/// Encodes a container path as a flat file name.
fn encode(cont_file: &Path) -> String {
    cont_file.to_string_lossy().replace('/', "#")
}

fn decode(name: &str) -> PathBuf {
    PathBuf::from(name.replace('#', "/"))
}

/// [`FileBinding`] backed by a temporary host directory.
#[derive(Debug)]
pub struct HostFileBind<'g> {
    guard: &'g SafePrefixSet,
    container_root: PathBuf,
    orig_dir: PathBuf,
    tmpdir: PathBuf,
    host_dir: Option<PathBuf>,
}

impl<'g> HostFileBind<'g> {
    /// Creates a binding for the container stored in `container_dir`.
    #[must_use]
    pub fn new(guard: &'g SafePrefixSet, container_dir: &Path, container_root: &Path, tmpdir: &Path) -> Self {
        Self {
            guard,
            container_root: container_root.to_path_buf(),
            orig_dir: container_dir.join(BIND_ORIG_DIR),
            tmpdir: tmpdir.to_path_buf(),
            host_dir: None,
        }
    }

    /// Creates the directories the binding needs inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn setup(&self) -> Result<()> {
        FileHandle::new(&self.orig_dir, self.guard).mkdir()?;
        FileHandle::new(self.container_bind_dir(), self.guard).mkdir()
    }

    /// Puts every preserved original back in place and removes the
    /// binding directories.
    ///
    /// # Errors
    ///
    /// Returns an error if an original cannot be moved back or a directory
    /// cannot be removed.
    pub fn restore(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.orig_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BurrowError::io(&self.orig_dir, e)),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let cont_path = self.in_container(&decode(&name));
            if fs::symlink_metadata(&cont_path).is_ok_and(|m| m.file_type().is_symlink()) {
                FileHandle::new(&cont_path, self.guard).remove(false, false)?;
            }
            fs::rename(entry.path(), &cont_path).map_err(|e| BurrowError::io(&cont_path, e))?;
            tracing::debug!(file = %cont_path.display(), "original file restored");
        }
        FileHandle::new(&self.orig_dir, self.guard).remove(false, true)?;
        FileHandle::new(self.container_bind_dir(), self.guard).remove(false, true)
    }

    /// Returns the host directory of a started binding.
    #[must_use]
    pub fn host_dir(&self) -> Option<&Path> {
        self.host_dir.as_deref()
    }

    fn container_bind_dir(&self) -> PathBuf {
        self.in_container(Path::new(BIND_HOST_DIR))
    }

    fn in_container(&self, cont_file: &Path) -> PathBuf {
        self.container_root
            .join(cont_file.strip_prefix("/").unwrap_or(cont_file))
    }
}

impl FileBinding for HostFileBind<'_> {
    fn start(&mut self, system_files: &[PathBuf]) -> Result<(PathBuf, PathBuf)> {
        let mut handle = FileHandle::new(&self.tmpdir, self.guard);
        let host_dir = handle.mktmpdir(&self.tmpdir)?;
        FileHandle::new(&host_dir, self.guard).register_prefix();
        self.host_dir = Some(host_dir.clone());
        for file in system_files.iter().filter(|f| f.is_file()) {
            if fs::symlink_metadata(self.in_container(file)).is_err() {
                tracing::debug!(file = %file.display(), "no container copy, system file skipped");
                continue;
            }
            if let Err(e) = self.set_file(file, file) {
                tracing::warn!(file = %file.display(), error = %e, "system file not bound");
                continue;
            }
            self.add_file(file, file)?;
        }
        tracing::debug!(host_dir = %host_dir.display(), "file binding started");
        Ok((host_dir, PathBuf::from(BIND_HOST_DIR)))
    }

    fn set_file(&mut self, _host_file: &Path, cont_file: &Path) -> Result<()> {
        if cont_file.to_string_lossy().contains('#') {
            return Err(BurrowError::Config {
                message: format!("cannot bind {}: '#' in container path", cont_file.display()),
            });
        }
        let name = encode(cont_file);
        let cont_path = self.in_container(cont_file);
        let link_target = Path::new(BIND_HOST_DIR).join(&name);
        if fs::read_link(&cont_path).is_ok_and(|t| t == link_target) {
            return Ok(());
        }
        let orig_path = self.orig_dir.join(&name);
        if fs::symlink_metadata(&orig_path).is_err() {
            if !cont_path.is_file() {
                return Err(BurrowError::NotFound {
                    kind: "container file",
                    id: cont_file.display().to_string(),
                });
            }
            fs::rename(&cont_path, &orig_path).map_err(|e| BurrowError::io(&cont_path, e))?;
        } else if fs::symlink_metadata(&cont_path).is_ok() {
            FileHandle::new(&cont_path, self.guard).remove(false, false)?;
        }
        std::os::unix::fs::symlink(&link_target, &cont_path).map_err(|e| BurrowError::io(&cont_path, e))?;
        tracing::debug!(file = %cont_file.display(), "container file bound to host copy");
        Ok(())
    }

    fn add_file(&mut self, host_file: &Path, cont_file: &Path) -> Result<()> {
        let Some(host_dir) = &self.host_dir else {
            return Err(BurrowError::Config {
                message: "file binding used before start".into(),
            });
        };
        let dest = host_dir.join(encode(cont_file));
        let mut existing = FileHandle::new(&dest, self.guard);
        existing.remove(false, false)?;
        FileHandle::new(host_file, self.guard).copyto(&dest)
    }

    fn get_path(&self, cont_file: &Path) -> PathBuf {
        self.host_dir
            .as_ref()
            .map_or_else(PathBuf::new, |dir| dir.join(encode(cont_file)))
    }

    fn finish(&mut self) {
        let Some(host_dir) = self.host_dir.take() else {
            return;
        };
        if let Err(e) = FileHandle::new(&host_dir, self.guard).remove(false, true) {
            tracing::warn!(host_dir = %host_dir.display(), error = %e, "file binding not released");
        }
    }
}

impl Drop for HostFileBind<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
