//! Binary entry point for the Nimus CLI.

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use nimus::{
    BatchReport, BootstrapScripts, Catalog, CatalogError, ConfigError, Confirm, CreateRequest,
    DriverStore, InstanceStatus, KeyGenerator, LifecycleError, LifecycleOrchestrator,
    NimusConfig, ProcessCommandRunner, ProjectStore, ProviderRegistry, RemoteBridge, StoreError,
    SshTransport,
};

mod cli;

use cli::{Cli, DriverCommand, InstanceCommand, ProjectCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

/// Prompts on the terminal before destructive actions.
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool, LifecycleError> {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|err| LifecycleError::Confirmation(err.to_string()))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = NimusConfig::load_without_cli_args()?;
    config.validate()?;
    let home = config.home_dir()?;
    debug!(home = %home, "using nimus home");

    match cli {
        Cli::Project(command) => project_command(&config, &home, command),
        Cli::Driver(command) => driver_command(&config, &home, command),
        Cli::Instance(command) => instance_command(&config, &home, command).await,
    }
}

fn catalog(
    config: &NimusConfig,
    home: &Utf8Path,
) -> Result<Catalog<ProcessCommandRunner>, CliError> {
    Ok(Catalog::new(
        ProjectStore::load(home)?,
        DriverStore::load(home)?,
        ProviderRegistry::with_defaults(config.google_settings()),
        KeyGenerator::new(ProcessCommandRunner, config.ssh_keygen_bin.clone()),
    ))
}

fn project_command(
    config: &NimusConfig,
    home: &Utf8Path,
    command: ProjectCommand,
) -> Result<(), CliError> {
    let mut projects = catalog(config, home)?;
    let mut stdout = io::stdout();
    match command {
        ProjectCommand::Create(args) => {
            let created = projects.project_create(&args.name)?;
            writeln!(stdout, "created project {}", created.name)?;
        }
        ProjectCommand::List => {
            writeln!(stdout, "{:<24} {:>9}", "PROJECT", "INSTANCES")?;
            for summary in projects.project_list() {
                writeln!(stdout, "{:<24} {:>9}", summary.name, summary.instances)?;
            }
        }
        ProjectCommand::Remove(args) => {
            let removed = projects.project_remove(&args.name)?;
            writeln!(stdout, "removed project {}", removed.name)?;
        }
    }
    Ok(())
}

fn driver_command(
    config: &NimusConfig,
    home: &Utf8Path,
    command: DriverCommand,
) -> Result<(), CliError> {
    let mut drivers = catalog(config, home)?;
    let mut stdout = io::stdout();
    match command {
        DriverCommand::Create(args) => {
            let credentials = Utf8PathBuf::from(args.credentials);
            let created = drivers.driver_create(&args.provider, &args.name, &credentials)?;
            writeln!(stdout, "created {} driver {}", created.provider, created.name)?;
        }
        DriverCommand::List => {
            writeln!(stdout, "{:<24} {:<10}", "DRIVER", "PROVIDER")?;
            for summary in drivers.driver_list() {
                writeln!(stdout, "{:<24} {:<10}", summary.name, summary.provider)?;
            }
        }
        DriverCommand::Remove(args) => {
            let removed = drivers.driver_remove(&args.name)?;
            writeln!(stdout, "removed driver {}", removed.name)?;
        }
    }
    Ok(())
}

fn orchestrator(
    config: &NimusConfig,
    home: &Utf8Path,
) -> Result<LifecycleOrchestrator<SshTransport>, CliError> {
    let cwd = std::env::current_dir()?;
    let working_dir = Utf8PathBuf::from_path_buf(cwd).map_err(|path| {
        CliError::InvalidCommand(format!(
            "working directory is not UTF-8: {}",
            path.display()
        ))
    })?;

    Ok(LifecycleOrchestrator::new(
        ProviderRegistry::with_defaults(config.google_settings()),
        ProjectStore::load(home)?,
        DriverStore::load(home)?,
        RemoteBridge::new(SshTransport::new(config.ssh_settings()), working_dir),
        BootstrapScripts::new(config.scripts_root()),
    )
    .with_settings(config.lifecycle_settings()))
}

async fn instance_command(
    config: &NimusConfig,
    home: &Utf8Path,
    command: InstanceCommand,
) -> Result<(), CliError> {
    let lifecycle = orchestrator(config, home)?;
    let mut stdout = io::stdout();
    match command {
        InstanceCommand::Create(args) => {
            let request = CreateRequest::new(args.project, args.driver, args.name)
                .with_count(args.count)
                .with_machine_type(args.machine_type)
                .with_zone(args.zone);
            let report = lifecycle.create(&request).await?;
            for instance in report.succeeded() {
                writeln!(
                    stdout,
                    "created {} ({})",
                    instance.name,
                    instance.external_ip().unwrap_or("no external IP")
                )?;
            }
            ensure_complete(&report)
        }
        InstanceCommand::List => {
            let rows = lifecycle.list().await;
            write_status_table(&mut stdout, &rows)?;
            Ok(())
        }
        InstanceCommand::Remove(args) => {
            let report = lifecycle
                .remove(&args.project, &args.name, &TerminalConfirm, args.yes)
                .await?;
            if report.is_empty() {
                writeln!(stdout, "nothing removed")?;
            }
            for name in report.succeeded() {
                writeln!(stdout, "removed {name}")?;
            }
            ensure_complete(&report)
        }
        InstanceCommand::Setup(args) => {
            lifecycle.setup(&args.project, &args.name).await?;
            writeln!(stdout, "instance {} is set up", args.name)?;
            Ok(())
        }
        InstanceCommand::Run(args) => {
            validate_command_args(&args.command)?;
            let payload = render_payload(&args.command);
            lifecycle
                .run(&args.target.project, &args.target.name, &payload)
                .await?;
            Ok(())
        }
    }
}

fn ensure_complete<T>(report: &BatchReport<T>) -> Result<(), CliError> {
    let failed = report.failed();
    if failed == 0 {
        return Ok(());
    }
    Err(LifecycleError::PartialBatchFailure {
        failed,
        total: report.total(),
    }
    .into())
}

fn write_status_table(mut target: impl Write, rows: &[InstanceStatus]) -> io::Result<()> {
    writeln!(
        target,
        "{:<16} {:<20} {:<16} {:<15} {:<15} {}",
        "PROJECT", "INSTANCE", "OS", "INTERNAL IP", "EXTERNAL IP", "STATUS"
    )?;
    for row in rows {
        writeln!(
            target,
            "{:<16} {:<20} {:<16} {:<15} {:<15} {}",
            row.project,
            row.instance,
            row.os,
            row.internal_ip.as_deref().unwrap_or("-"),
            row.external_ip.as_deref().unwrap_or("-"),
            row.status
        )?;
    }
    Ok(())
}

/// A single argument is passed through as written so it can name a local
/// script or carry its own shell syntax; multiple arguments are escaped.
fn render_payload(args: &[String]) -> String {
    if let [single] = args {
        return single.clone();
    }
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\r' | '\u{0000}'))
        {
            return Err(CliError::InvalidCommand(String::from(
                "command arguments must not contain carriage returns or NUL bytes",
            )));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use nimus::{BulkResult, TaskMetrics};
    use std::time::Duration;

    use super::*;

    fn status(instance: &str, external_ip: Option<&str>, state: &str) -> InstanceStatus {
        InstanceStatus {
            project: "demo".to_owned(),
            instance: instance.to_owned(),
            os: "debian-12".to_owned(),
            internal_ip: Some("10.0.0.2".to_owned()),
            external_ip: external_ip.map(str::to_owned),
            status: state.to_owned(),
        }
    }

    #[test]
    fn single_payload_argument_is_kept_verbatim() {
        let payload = render_payload(&[String::from("uptime && df -h")]);
        assert_eq!(payload, "uptime && df -h");
    }

    #[test]
    fn multiple_payload_arguments_are_escaped() {
        let args = vec![
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ];
        assert_eq!(render_payload(&args), "echo 'a b' 'c'\\''d'");
    }

    #[test]
    fn validate_command_args_rejects_nul_bytes() {
        let err = validate_command_args(&[String::from("echo\u{0000}")])
            .expect_err("NUL should be rejected");
        assert!(
            matches!(err, CliError::InvalidCommand(_)),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn status_table_shows_placeholders_for_missing_addresses() {
        let mut buf = Vec::new();
        write_status_table(
            &mut buf,
            &[
                status("web-1", Some("203.0.113.1"), "RUNNING"),
                status("web-2", None, "DELETED"),
            ],
        )
        .unwrap_or_else(|err| panic!("write table: {err}"));

        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().any(|line| line.contains("203.0.113.1") && line.ends_with("RUNNING")));
        assert!(lines.iter().any(|line| line.contains("web-2") && line.contains(" - ") && line.ends_with("DELETED")));
    }

    #[test]
    fn reports_with_failures_become_errors() {
        let metrics = TaskMetrics {
            index: 0,
            elapsed: Duration::ZERO,
        };
        let report = BatchReport::new(vec![
            BulkResult {
                item: Some("web-1".to_owned()),
                error: None,
                metrics,
            },
            BulkResult {
                item: None,
                error: Some("quota".to_owned()),
                metrics,
            },
        ]);

        let err = ensure_complete(&report).expect_err("one item failed");
        assert_eq!(err.to_string(), "1 of 2 operations failed");
        assert!(ensure_complete(&BatchReport::<String>::default()).is_ok());
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::InvalidCommand("bad".to_owned()));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(rendered, "invalid command argument: bad\n");
    }
}
