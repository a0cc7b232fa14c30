//! `burrow inspect-spec` — Print a container's OCI runtime spec.

use std::io::Write;

use burrow_common::config::BurrowConfig;
use burrow_common::constants::SPEC_FILE;
use burrow_common::types::ContainerId;
use burrow_runtime::spec::RuntimeSpec;
use burrow_runtime::store::ContainerStore;
use clap::Args;

/// Arguments for the `inspect-spec` command.
#[derive(Args, Debug)]
pub struct InspectSpecArgs {
    /// Container whose spec is printed.
    pub container: String,
}

/// Executes the `inspect-spec` command.
///
/// # Errors
///
/// Returns an error if the container has no readable spec or stdout cannot
/// be written.
pub fn execute(config: &BurrowConfig, args: &InspectSpecArgs) -> anyhow::Result<()> {
    let id = ContainerId::parse(args.container.as_str())?;
    let container_dir = ContainerStore::new(config).container_dir(&id)?;
    let spec = RuntimeSpec::load(&container_dir.join(SPEC_FILE))?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", spec.to_json()?)?;
    Ok(())
}
