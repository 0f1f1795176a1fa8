mod cli;
mod status;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, LogFormat};
use migrun_config::{AppConfig, ConfigLoader, DirectorySource};
use migrun_db::{CancelToken, DownTarget, Migrator, RunReport, SqliteStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Retry later: another run holds the lock or the database is unreachable.
const EXIT_TEMPFAIL: u8 = 75;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            match e.downcast_ref::<migrun_common::Error>() {
                Some(err) if err.failed_migration().is_some() => {
                    eprintln!("error: {err}");
                    if let migrun_common::Error::MigrationFailed {
                        operation: Some(index),
                        ..
                    } = err
                    {
                        eprintln!("  at operation index {index}");
                    }
                    eprintln!("  cause: {}", err.root_cause());
                }
                _ => eprintln!("error: {e:#}"),
            }
            code
        }
    }
}

fn init_tracing(format: LogFormat, verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Up { to } => {
            let report = run_migrations(config, move |migrator, store, cancel| {
                migrator.up(store, to, cancel)
            })
            .await?;
            Ok(finish(&report))
        }
        Command::Down(args) => {
            let target = match (args.to, args.all) {
                (Some(id), _) => DownTarget::To(id),
                (None, true) => DownTarget::All,
                (None, false) => DownTarget::Last,
            };
            let report = run_migrations(config, move |migrator, store, cancel| {
                migrator.down(store, target, cancel)
            })
            .await?;
            Ok(finish(&report))
        }
        Command::Status { json } => {
            let database = config.database.path.clone();
            let status = tokio::task::spawn_blocking(move || {
                let store = SqliteStore::from_config(&config.database)?;
                let migrator = load_migrator(&config)?;
                migrator.status(&store)
            })
            .await
            .context("status task panicked")??;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", status::render(&status, &database));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Unlock => {
            let removed = tokio::task::spawn_blocking(move || {
                let store = SqliteStore::from_config(&config.database)?;
                Migrator::load(Vec::new(), config.runner.clone())?.force_unlock(&store)
            })
            .await
            .context("unlock task panicked")??;

            match removed {
                Some(lock) => println!(
                    "released migration lock held by {} since {}",
                    lock.holder, lock.acquired_at
                ),
                None => println!("no migration lock was held"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(database) = &cli.database {
        config.database.path = database.clone();
    }
    if let Some(dir) = &cli.migrations {
        config.migrations.dir = dir.clone();
    }
    Ok(config)
}

fn load_migrator(config: &AppConfig) -> migrun_common::Result<Migrator> {
    let records = DirectorySource::new(&config.migrations.dir).load()?;
    Migrator::load(records, config.runner.clone())
}

/// Run a migration pass on the blocking pool. Ctrl-C cancels before the next
/// migration; the one in flight always finishes or rolls back.
async fn run_migrations<F>(config: AppConfig, pass: F) -> Result<RunReport>
where
    F: FnOnce(&Migrator, &SqliteStore, &CancelToken) -> migrun_common::Result<RunReport>
        + Send
        + 'static,
{
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current migration");
            on_signal.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || {
        let store = SqliteStore::from_config(&config.database)?;
        let migrator = load_migrator(&config)?;
        pass(&migrator, &store, &cancel)
    })
    .await;
    signal_task.abort();

    Ok(result.context("migration task panicked")??)
}

fn finish(report: &RunReport) -> ExitCode {
    let direction = match report.direction {
        migrun_db::Direction::Up => "applied",
        migrun_db::Direction::Down => "reverted",
    };
    if report.migrations.is_empty() && !report.cancelled {
        println!("nothing to do");
    } else {
        println!(
            "{direction} {} migration(s) in {}ms: {}",
            report.migrations.len(),
            report.elapsed_ms,
            report.migrations.join(", ")
        );
    }
    if report.skipped_operations > 0 {
        info!(
            "{} operation(s) were already in place and skipped",
            report.skipped_operations
        );
    }

    if report.cancelled {
        eprintln!("run cancelled; remaining migrations were not started");
        ExitCode::from(EXIT_CANCELLED)
    } else {
        ExitCode::SUCCESS
    }
}

fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<migrun_common::Error>() {
        Some(err) if err.is_retryable() => ExitCode::from(EXIT_TEMPFAIL),
        _ => ExitCode::FAILURE,
    }
}
