//! CLI command definitions and dispatch.

pub mod inspect_spec;
pub mod run;
pub mod setup;

use std::path::PathBuf;

use anyhow::Context;
use burrow_common::config::BurrowConfig;
use burrow_common::constants::{CONFIG_FILE, default_topdir};
use clap::{Parser, Subcommand};

/// Burrow — run containers without root privileges.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Base directory holding containers and bundled binaries.
    #[arg(long, global = true, env = "BURROW_DIR")]
    pub topdir: Option<PathBuf>,

    /// Configuration file (defaults to `<topdir>/burrow.json`).
    #[arg(long, global = true, env = "BURROW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log debug details and run the OCI runtime in debug mode.
    #[arg(long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command inside a container.
    Run(run::RunArgs),
    /// Change a container's execution mode, GPU access or link form.
    Setup(setup::SetupArgs),
    /// Print a container's OCI runtime spec.
    InspectSpec(inspect_spec::InspectSpecArgs),
}

/// Dispatches the parsed CLI command and returns the process exit status.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails before a container status is available.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(cli.topdir, cli.config)?;
    match cli.command {
        Command::Run(args) => run::execute(&config, args),
        Command::Setup(args) => setup::execute(&config, &args).map(|()| 0),
        Command::InspectSpec(args) => inspect_spec::execute(&config, &args).map(|()| 0),
    }
}

/// Loads the configuration; an explicit `--topdir` wins over the file's.
fn load_config(topdir: Option<PathBuf>, config: Option<PathBuf>) -> anyhow::Result<BurrowConfig> {
    let base = topdir.clone().unwrap_or_else(default_topdir);
    let path = config.unwrap_or_else(|| base.join(CONFIG_FILE));
    let mut loaded =
        BurrowConfig::load(&path).with_context(|| format!("loading configuration {}", path.display()))?;
    if let Some(topdir) = topdir {
        loaded.topdir = topdir;
    }
    tracing::debug!(config = %path.display(), topdir = %loaded.topdir.display(), "configuration loaded");
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topdir_flag_overrides_configuration() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"shm_size": "1g", "topdir": "/elsewhere"}"#)
            .expect("write");
        let config = load_config(Some(dir.path().to_path_buf()), None).expect("config");
        assert_eq!(config.topdir, dir.path());
        assert_eq!(config.shm_size, "1g");
    }

    #[test]
    fn malformed_configuration_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").expect("write");
        assert!(load_config(None, Some(path)).is_err());
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "burrow", "--topdir", "/tmp/b", "run", "-v", "/srv:/data", "-e", "A=1", "--device", "/dev/fuse",
            "-w", "/work", "c1", "ls", "-la",
        ])
        .expect("parse");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.container, "c1");
        assert_eq!(args.cmd, ["ls", "-la"]);
        assert_eq!(args.volumes.len(), 1);
        assert_eq!(args.env, ["A=1"]);
        assert_eq!(args.workdir, "/work");
    }
}
