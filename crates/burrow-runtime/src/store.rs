//! On-disk container bundles.
//!
//! ```text
//! <topdir>/containers/<id>/
//!     ROOT/            root filesystem
//!     config.json      execution spec
//!     container.json   image metadata
//!     execmode         selected execution mode
//!     gpu              GPU passthrough marker
//!     links.root       root the symlinks were rewritten for, if any
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burrow_common::config::BurrowConfig;
use burrow_common::constants::{EXECMODE_FILE, LINKS_ROOT_FILE, METADATA_FILE, ROOT_DIR};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ContainerId, ExecMode};
use burrow_core::fileops::FileHandle;
use burrow_core::guard::SafePrefixSet;
use burrow_core::host::HostIdentity;
use burrow_core::links::LinkTranslator;
use serde::{Deserialize, Serialize};

use crate::filebind::HostFileBind;

/// Image configuration recorded when the container was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerMetadata {
    /// Default command.
    pub cmd: Vec<String>,
    /// Entrypoint prepended to the command.
    pub entrypoint: Vec<String>,
    /// `KEY=VALUE` image environment.
    pub env: Vec<String>,
    /// Default working directory.
    pub working_dir: String,
    /// Default user.
    pub user: String,
    /// Default hostname.
    pub hostname: String,
}

/// Locates container bundles under the configured top directory.
#[derive(Debug, Clone)]
pub struct ContainerStore {
    containers_dir: PathBuf,
}

impl ContainerStore {
    /// Creates a store rooted at the configuration's containers directory.
    #[must_use]
    pub fn new(config: &BurrowConfig) -> Self {
        Self {
            containers_dir: config.containers_dir(),
        }
    }

    /// Returns the directory of an existing container.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if the container has no root filesystem.
    pub fn container_dir(&self, id: &ContainerId) -> Result<PathBuf> {
        let dir = self.containers_dir.join(id.as_str());
        if !dir.join(ROOT_DIR).is_dir() {
            return Err(BurrowError::NotFound {
                kind: "container",
                id: id.to_string(),
            });
        }
        Ok(dir)
    }

    /// Reads the container's image metadata; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn metadata(container_dir: &Path) -> Result<ContainerMetadata> {
        let path = container_dir.join(METADATA_FILE);
        match fs::read_to_string(&path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ContainerMetadata::default()),
            Err(e) => Err(BurrowError::io(&path, e)),
        }
    }
}

/// Reads and writes the per-container execution mode.
#[derive(Debug)]
pub struct ExecModeStore<'a> {
    guard: &'a SafePrefixSet,
    container_dir: &'a Path,
    default: ExecMode,
}

impl<'a> ExecModeStore<'a> {
    /// Creates a store for the container in `container_dir`.
    #[must_use]
    pub const fn new(guard: &'a SafePrefixSet, container_dir: &'a Path, default: ExecMode) -> Self {
        Self {
            guard,
            container_dir,
            default,
        }
    }

    /// Returns the recorded mode, or the default when none is recorded or it
    /// cannot be parsed.
    #[must_use]
    pub fn get(&self) -> ExecMode {
        let path = self.container_dir.join(EXECMODE_FILE);
        let Ok(content) = fs::read_to_string(&path) else {
            return self.default;
        };
        content.trim().parse().unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid execution mode");
            self.default
        })
    }

    /// Records `mode`, preparing or undoing the file binding as the
    /// engine family changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the binding cannot be prepared or restored, or the
    /// mode cannot be written.
    pub fn set(&self, mode: ExecMode, tmpdir: &Path) -> Result<()> {
        let previous = self.get();
        let root = self.container_dir.join(ROOT_DIR);
        let binding = HostFileBind::new(self.guard, self.container_dir, &root, tmpdir);
        if mode.uses_namespaces() {
            binding.setup()?;
        } else if previous.uses_namespaces() {
            binding.restore()?;
        }
        let path = self.container_dir.join(EXECMODE_FILE);
        FileHandle::new(&path, self.guard).putdata(&mode.to_string())?;
        tracing::info!(dir = %self.container_dir.display(), from = %previous, to = %mode, "execution mode set");
        Ok(())
    }
}

/// How absolute symlinks inside `ROOT` are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Targets are prefixed with the host location of `ROOT`.
    Host,
    /// Targets are relative to the container root (image form).
    Container,
}

/// Rewrites the container's absolute symlinks into `mode`.
///
/// The root used for host-rooted links is recorded in `links.root`, so a
/// later switch back strips the right prefix even if the container moved.
/// Returns the number of links changed.
///
/// # Errors
///
/// Returns an error if the record cannot be read, written or removed.
pub fn set_link_mode(guard: &SafePrefixSet, container_dir: &Path, mode: LinkMode, force: bool) -> Result<usize> {
    let root = container_dir.join(ROOT_DIR);
    let record = container_dir.join(LINKS_ROOT_FILE);
    let translator = LinkTranslator::new(guard, HostIdentity::current().uid);
    let mut changed = 0;
    let recorded = fs::read_to_string(&record).ok().map(|r| PathBuf::from(r.trim()));
    if let Some(orig_root) = &recorded {
        changed += translator.links_conv(&root, false, orig_root, force).len();
        FileHandle::new(&record, guard).remove(false, false)?;
    }
    if mode == LinkMode::Host {
        changed += translator.links_conv(&root, true, Path::new(""), force).len();
        FileHandle::new(&record, guard).putdata(&root.to_string_lossy())?;
    }
    tracing::info!(dir = %container_dir.display(), ?mode, changed, "links converted");
    Ok(changed)
}

/// Ensures links are in container form before an engine that changes root
/// runs. A container without a `links.root` record is left untouched.
///
/// # Errors
///
/// Returns an error if a recorded conversion cannot be undone.
pub fn ensure_container_links(guard: &SafePrefixSet, container_dir: &Path) -> Result<()> {
    if container_dir.join(LINKS_ROOT_FILE).exists() {
        let _ = set_link_mode(guard, container_dir, LinkMode::Container, true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    fn container() -> (tempfile::TempDir, PathBuf, SafePrefixSet) {
        let dir = tempfile::tempdir().expect("tempdir");
        let container_dir = dir.path().join("containers/c1");
        fs::create_dir_all(container_dir.join("ROOT/etc")).expect("mkdir");
        let guard = SafePrefixSet::with_prefixes([&container_dir]);
        (dir, container_dir, guard)
    }

    #[test]
    fn missing_container_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BurrowConfig {
            topdir: dir.path().to_path_buf(),
            ..BurrowConfig::default()
        };
        let store = ContainerStore::new(&config);
        let id = ContainerId::parse("nope").expect("id");
        assert!(matches!(store.container_dir(&id), Err(BurrowError::NotFound { .. })));

        fs::create_dir_all(dir.path().join("containers/nope/ROOT")).expect("mkdir");
        assert_eq!(store.container_dir(&id).expect("dir"), dir.path().join("containers/nope"));
    }

    #[test]
    fn metadata_reads_image_fields() {
        let (_dir, container_dir, _guard) = container();
        assert_eq!(ContainerStore::metadata(&container_dir).expect("defaults"), ContainerMetadata::default());
        fs::write(
            container_dir.join(METADATA_FILE),
            r#"{"Cmd": ["nginx"], "Entrypoint": ["/docker-entrypoint.sh"], "WorkingDir": "/srv", "Env": ["A=1"]}"#,
        )
        .expect("write");
        let meta = ContainerStore::metadata(&container_dir).expect("meta");
        assert_eq!(meta.cmd, ["nginx"]);
        assert_eq!(meta.entrypoint, ["/docker-entrypoint.sh"]);
        assert_eq!(meta.working_dir, "/srv");
        assert!(meta.user.is_empty());
    }

    #[test]
    fn exec_mode_defaults_and_persists() {
        let (dir, container_dir, guard) = container();
        let modes = ExecModeStore::new(&guard, &container_dir, ExecMode::P1);
        assert_eq!(modes.get(), ExecMode::P1);

        modes.set(ExecMode::R1, dir.path()).expect("set");
        assert_eq!(modes.get(), ExecMode::R1);
        assert!(container_dir.join(".bind_orig_files").is_dir());

        modes.set(ExecMode::P2, dir.path()).expect("set");
        assert_eq!(modes.get(), ExecMode::P2);
        assert!(!container_dir.join(".bind_orig_files").exists());
    }

    #[test]
    fn link_mode_roundtrip_is_recorded() {
        let (_dir, container_dir, guard) = container();
        let root = container_dir.join("ROOT");
        symlink("/etc/real", root.join("etc/alias")).expect("symlink");

        assert_eq!(set_link_mode(&guard, &container_dir, LinkMode::Host, false).expect("host"), 1);
        assert_eq!(fs::read_link(root.join("etc/alias")).expect("link"), root.join("etc/real"));
        assert!(container_dir.join(LINKS_ROOT_FILE).exists());

        ensure_container_links(&guard, &container_dir).expect("restore");
        assert_eq!(fs::read_link(root.join("etc/alias")).expect("link"), Path::new("/etc/real"));
        assert!(!container_dir.join(LINKS_ROOT_FILE).exists());
    }
}
