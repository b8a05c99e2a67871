//! Command-line interface definitions for the `nimus` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `nimus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "nimus",
    about = "Provision cloud instances, bootstrap them with Docker, and run commands over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Manage instances tracked in a project.
    #[command(subcommand)]
    Instance(InstanceCommand),
    /// Manage provider credentials.
    #[command(subcommand)]
    Driver(DriverCommand),
    /// Manage projects and their SSH keys.
    #[command(subcommand)]
    Project(ProjectCommand),
}

/// `nimus instance` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum InstanceCommand {
    /// Create one instance, or a numbered batch with --count.
    Create(CreateArgs),
    /// Refresh and show the status of every tracked instance.
    List,
    /// Remove an instance, or every member of a numbered batch.
    Remove(RemoveArgs),
    /// Re-apply the project key and re-run the bootstrap script.
    Setup(InstanceArgs),
    /// Run a command or a local script on an instance.
    Run(RunArgs),
}

/// Arguments for `nimus instance create`.
#[derive(Debug, Args)]
pub(crate) struct CreateArgs {
    /// Project receiving the instances.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) project: String,
    /// Driver used to reach the provider.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) driver: String,
    /// Instance name; batches are suffixed -1..-N.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) name: String,
    /// Machine type override.
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub(crate) machine_type: Option<String>,
    /// Zone override.
    #[arg(short, long)]
    pub(crate) zone: Option<String>,
    /// Number of instances to create.
    #[arg(short, long, default_value_t = 1)]
    pub(crate) count: usize,
}

/// Arguments for `nimus instance remove`.
#[derive(Debug, Args)]
pub(crate) struct RemoveArgs {
    /// Project owning the instance.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) project: String,
    /// Instance name, or batch base name.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) name: String,
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    pub(crate) yes: bool,
}

/// Project and instance selectors.
#[derive(Debug, Args)]
pub(crate) struct InstanceArgs {
    /// Project owning the instance.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) project: String,
    /// Instance name.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) name: String,
}

/// Arguments for `nimus instance run`.
#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    #[command(flatten)]
    pub(crate) target: InstanceArgs,
    /// Command, or path to a local script, to run remotely (use -- to
    /// separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// `nimus driver` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum DriverCommand {
    /// Register provider credentials.
    Create(DriverCreateArgs),
    /// Show registered drivers.
    List,
    /// Delete a driver.
    Remove(NameArgs),
}

/// Arguments for `nimus driver create`.
#[derive(Debug, Args)]
pub(crate) struct DriverCreateArgs {
    /// Provider identifier.
    #[arg(short, long, default_value = "gce")]
    pub(crate) provider: String,
    /// Driver name.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) name: String,
    /// Path to the provider's JSON credentials file.
    #[arg(short, long, value_name = "PATH")]
    pub(crate) credentials: String,
}

/// `nimus project` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum ProjectCommand {
    /// Create a project and its SSH key pair.
    Create(NameArgs),
    /// Show projects.
    List,
    /// Delete a project record; its keys are kept.
    Remove(NameArgs),
}

/// Single name argument.
#[derive(Debug, Args)]
pub(crate) struct NameArgs {
    /// Record name.
    #[arg(short, long, value_parser = kebab_name)]
    pub(crate) name: String,
}

/// Normalises a user-supplied name to kebab-case.
///
/// Letters are lower-cased, runs of other characters collapse to a single
/// `-`, and leading or trailing separators are dropped.
pub(crate) fn kebab_name(raw: &str) -> Result<String, String> {
    let mut name = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !name.is_empty() {
                name.push('-');
            }
            pending_separator = false;
            name.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    if name.is_empty() {
        return Err(format!("'{raw}' does not contain any letters or digits"));
    }
    Ok(name)
}
