//! Execution engines.
//!
//! A run is delegated to a namespace runtime (runc/crun, modes R1–R3) or to
//! the `PRoot` syscall-emulation engine (modes P1/P2). Both share the
//! container preparation in [`RunContext`].

pub mod emulation;
pub mod namespace;

use std::io::Write;
use std::path::{Path, PathBuf};

use burrow_common::config::{BurrowConfig, ExecutableSource};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ContainerId, ExecMode, RunOptions};
use burrow_core::guard::SafePrefixSet;
use burrow_core::host;
use burrow_core::namespace::user_namespaces_available;
use burrow_core::resolve;

pub use emulation::EmulationEngine;
pub use namespace::NamespaceEngine;

use crate::env::{self, EnvList, EnvRequest};
use crate::error::RunError;
use crate::store::{self, ContainerMetadata, ContainerStore};

/// A way of executing a prepared container.
pub trait ExecutionEngine {
    /// Locates the executable this engine drives.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable executable is found.
    fn select_runtime(&mut self) -> Result<PathBuf>;

    /// Runs the container with `opts`, returning the process exit code.
    ///
    /// # Errors
    ///
    /// Returns a [`RunError`] naming the stage that failed.
    fn run(&mut self, opts: &RunOptions) -> std::result::Result<i32, RunError>;
}

/// Everything a run needs to know about one container.
#[derive(Debug)]
pub struct RunContext<'a> {
    /// Active configuration.
    pub config: &'a BurrowConfig,
    /// Safe prefixes for this run.
    pub guard: &'a SafePrefixSet,
    /// Container identifier.
    pub id: ContainerId,
    /// Bundle directory.
    pub container_dir: PathBuf,
    /// Root filesystem inside the bundle.
    pub container_root: PathBuf,
    /// Image metadata.
    pub metadata: ContainerMetadata,
    /// Selected execution mode.
    pub mode: ExecMode,
}

/// Run options merged with the image defaults.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    /// Final command line.
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub cwd: String,
    /// User inside the container.
    pub user: String,
    /// Hostname; empty for the host's node name.
    pub hostname: String,
}

impl<'a> RunContext<'a> {
    /// Opens the container `id` and registers its bundle and the temp
    /// directory as safe prefixes.
    ///
    /// # Errors
    ///
    /// Returns an error if the container does not exist or its metadata is
    /// unreadable.
    pub fn open(
        config: &'a BurrowConfig,
        guard: &'a SafePrefixSet,
        id: ContainerId,
        mode: ExecMode,
    ) -> Result<Self> {
        let container_dir = ContainerStore::new(config).container_dir(&id)?;
        guard.register(&container_dir);
        if config.tmpdir.is_dir() {
            guard.register(&config.tmpdir);
        }
        let metadata = ContainerStore::metadata(&container_dir)?;
        let container_root = container_dir.join(burrow_common::constants::ROOT_DIR);
        tracing::debug!(%id, dir = %container_dir.display(), %mode, "container opened");
        Ok(Self {
            config,
            guard,
            id,
            container_dir,
            container_root,
            metadata,
            mode,
        })
    }

    /// Merges `opts` with the image metadata, restores container-form links
    /// and checks the command exists in the container.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Init`] when there is no command, links cannot be
    /// restored, or the command is not an executable in the container.
    pub fn prepare(&self, opts: &RunOptions) -> std::result::Result<PreparedRun, RunError> {
        warn_unsupported(opts);
        let meta = &self.metadata;
        let mut cmd = meta.entrypoint.clone();
        if opts.cmd.is_empty() {
            cmd.extend(meta.cmd.iter().cloned());
        } else {
            cmd.extend(opts.cmd.iter().cloned());
        }
        if cmd.is_empty() {
            return Err(RunError::Init(BurrowError::Config {
                message: "no command to execute".into(),
            }));
        }
        let cwd = [opts.cwd.as_str(), meta.working_dir.as_str(), "/"]
            .into_iter()
            .find(|c| !c.is_empty())
            .unwrap_or("/")
            .to_owned();
        let user = if opts.user.is_empty() { meta.user.clone() } else { opts.user.clone() };
        let hostname = if opts.hostname.is_empty() {
            meta.hostname.clone()
        } else {
            opts.hostname.clone()
        };

        store::ensure_container_links(self.guard, &self.container_dir).map_err(RunError::Init)?;
        self.check_exec(&cmd[0], opts, &cwd)?;
        Ok(PreparedRun {
            cmd,
            cwd,
            user,
            hostname,
        })
    }

    /// Builds and validates the container environment.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Environment`] for a malformed user entry.
    pub fn environment(&self, opts: &RunOptions, prepared: &PreparedRun) -> std::result::Result<EnvList, RunError> {
        let host_env: Vec<(String, String)> = std::env::vars().collect();
        let root = self.container_root.to_string_lossy();
        let mode = self.mode.to_string();
        let request = EnvRequest {
            hostenv: opts.hostenv,
            image_env: &self.metadata.env,
            user_env: &opts.env,
            user: &prepared.user,
            container_id: self.id.as_str(),
            container_root: &root,
            execmode: &mode,
        };
        env::build(self.config, &request, &host_env).map_err(RunError::Environment)
    }

    fn check_exec(&self, name: &str, opts: &RunOptions, cwd: &str) -> std::result::Result<(), RunError> {
        let path_env = self
            .metadata
            .env
            .iter()
            .rev()
            .find_map(|e| e.strip_prefix("PATH="))
            .unwrap_or(self.config.root_path.as_str());
        let search: Vec<String> = path_env.split(':').map(str::to_owned).collect();
        let found = resolve::find_exec(name, &search, &self.container_root, &opts.volumes, Path::new(cwd));
        if found.as_os_str().is_empty() {
            return Err(RunError::Init(BurrowError::NotFound {
                kind: "executable in container",
                id: name.to_owned(),
            }));
        }
        tracing::debug!(exec = %found.display(), "command found");
        Ok(())
    }
}

/// Returns the engine for `ctx.mode`, falling back to emulation when user
/// namespaces are unavailable.
#[must_use]
pub fn engine_for<'a>(ctx: RunContext<'a>) -> Box<dyn ExecutionEngine + 'a> {
    engine_for_mode(ctx, user_namespaces_available())
}

fn engine_for_mode<'a>(mut ctx: RunContext<'a>, userns: bool) -> Box<dyn ExecutionEngine + 'a> {
    if ctx.mode.uses_namespaces() {
        if userns {
            return Box::new(NamespaceEngine::new(ctx));
        }
        tracing::warn!(mode = %ctx.mode, "user namespaces unavailable, falling back to P1");
        ctx.mode = ExecMode::P1;
    }
    Box::new(EmulationEngine::new(ctx))
}

/// Locates a helper executable named `name` according to `source`.
///
/// `search` tries `$PATH` first, then the architecture-specific binaries in
/// `bin_dir`; `bundled` only the latter.
///
/// # Errors
///
/// Returns [`BurrowError::NotFound`] if nothing usable is found.
pub fn select_executable(source: &ExecutableSource, names: &[&str], bin_dir: &Path) -> Result<PathBuf> {
    let found = match source {
        ExecutableSource::Path(path) => path.is_file().then(|| path.clone()),
        ExecutableSource::Search => names
            .iter()
            .find_map(|name| which::which(name).ok())
            .or_else(|| bundled(names, bin_dir)),
        ExecutableSource::Bundled => bundled(names, bin_dir),
    };
    let found = found.ok_or_else(|| BurrowError::NotFound {
        kind: "executable",
        id: names.join(" or "),
    })?;
    tracing::debug!(exec = %found.display(), "executable selected");
    Ok(found)
}

fn bundled(names: &[&str], bin_dir: &Path) -> Option<PathBuf> {
    let suffix = host::arch_binary_suffix();
    let candidates: Vec<String> = names
        .iter()
        .flat_map(|name| {
            suffix
                .map(|s| format!("{name}-{s}"))
                .into_iter()
                .chain(std::iter::once((*name).to_owned()))
        })
        .collect();
    let found = resolve::find_file_in_dir(bin_dir, &candidates);
    (!found.as_os_str().is_empty()).then_some(found)
}

/// Returns the command prefix pinning execution to `cpuset`.
///
/// The first tool of `tools` found on `$PATH` is used, with `%s` replaced
/// by the CPU set. Empty when no CPU set is requested or no tool exists.
#[must_use]
pub fn cpu_affinity(tools: &[Vec<String>], cpuset: &str) -> Vec<String> {
    if cpuset.is_empty() {
        return Vec::new();
    }
    for tool in tools {
        let Some((name, args)) = tool.split_first() else {
            continue;
        };
        if let Ok(path) = which::which(name) {
            let mut prefix = vec![path.to_string_lossy().into_owned()];
            prefix.extend(args.iter().map(|a| a.replace("%s", cpuset)));
            return prefix;
        }
    }
    tracing::warn!(cpuset, "no cpu affinity tool found, ignoring cpuset");
    Vec::new()
}

/// Prints the run banner to standard error.
pub fn banner(id: &ContainerId, command: &str, marker: char) {
    let rule = "*".repeat(78);
    let title = format!("STARTING {id}");
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(
        stderr,
        " \n{rule}\n*{title:^76}*\n{rule}\n executing: {}",
        Path::new(command)
            .file_name()
            .map_or_else(|| command.to_owned(), |n| n.to_string_lossy().into_owned())
    );
    let _ = writeln!(stderr, " {marker}");
}

fn warn_unsupported(opts: &RunOptions) {
    if !opts.ports.is_empty() {
        tracing::warn!("this execution mode does not support -p --publish");
    }
    if opts.netcoop {
        tracing::warn!("this execution mode does not support -P --netcoop --publish-all");
    }
}
