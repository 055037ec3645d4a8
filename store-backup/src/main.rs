//! Store Backup - operator CLI
//!
//! Exit codes: 0 success, 1 failure, 2 checksum mismatch on `restore stage`,
//! 3 restore already pending.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use store_backup::{
    catalog::BackupStore,
    config::Config,
    restore::{DiagnosticsReporter, EmergencyCleanup, StartupRestoreProcessor},
    utils, BackupError, BackupSystem, BackupTrigger, TickOutcome,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Application data directory used when no config file is given
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backup archive commands
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Staged restore commands
    #[command(subcommand)]
    Restore(RestoreCommand),
    /// Scheduler commands
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Take a backup now and apply retention
    Create {
        /// Record the backup as manual instead of scheduled
        #[arg(long)]
        manual: bool,
    },
    /// List backups, most recent first
    List {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print backup health
    Health,
    /// Apply retention
    Prune {
        /// Number of backups to keep (defaults to schedule.retention_count)
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum RestoreCommand {
    /// Verify and stage a backup for the next startup
    Stage { backup_id: String },
    /// Print the state of backups and any pending restore
    Diagnose {
        #[arg(long)]
        json: bool,
    },
    /// Remove the restore descriptor and staging contents unconditionally
    EmergencyClear,
    /// Apply a pending restore now (the application must not be running)
    ApplyPending,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Run one scheduler tick
    Tick,
}

/// Map a failure of `restore stage` to its exit code.
fn stage_exit_code(err: &BackupError) -> u8 {
    match err {
        BackupError::ChecksumMismatch { .. } => 2,
        BackupError::RestoreAlreadyPending { .. } => 3,
        _ => 1,
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let config = Config::for_data_dir(&args.data_dir);
            config.validate()?;
            config
        }
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("error: failed to initialize logging: {e}");
    }

    match run(args.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command, config: Config) -> Result<u8> {
    match command {
        Command::Backup(cmd) => run_backup(cmd, config).await,
        Command::Restore(cmd) => run_restore(cmd, config).await,
        Command::Schedule(ScheduleCommand::Tick) => {
            let system = BackupSystem::open(config)?;
            let outcome = system.schedule.on_tick().await?;
            system.close();
            match outcome {
                TickOutcome::Completed(rec) => println!("backup {} created", rec.id),
                TickOutcome::NotDue { next_due } => println!("not due until {}", next_due.to_rfc3339()),
                TickOutcome::Disabled => println!("schedule disabled"),
                TickOutcome::Busy => println!("another operation is in progress"),
                TickOutcome::Failed(error) => {
                    println!("backup failed: {error}");
                    return Ok(1);
                }
            }
            Ok(0)
        }
    }
}

async fn run_backup(cmd: BackupCommand, config: Config) -> Result<u8> {
    match cmd {
        BackupCommand::Create { manual } => {
            let system = BackupSystem::open(config)?;
            let result = if manual {
                system.schedule.run_now().await
            } else {
                let result = system.service.create_backup(BackupTrigger::Scheduled).await;
                if result.is_ok() {
                    if let Err(e) = system.schedule.prune(system.config.schedule.retention_count).await {
                        tracing::warn!(error = %e, "Pruning failed, backups kept");
                    }
                }
                result
            };
            system.close();
            match result {
                Ok(rec) => {
                    println!("{}\t{}\t{} bytes\t{}", rec.id, rec.created_at.to_rfc3339(), rec.size_bytes, rec.checksum);
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("backup failed: {e}");
                    Ok(1)
                }
            }
        }
        BackupCommand::List { limit, json } => {
            let store = open_store(&config)?;
            let records = store.list(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for rec in records {
                    println!(
                        "{}\t{}\t{}\t{} bytes\t{}",
                        rec.id,
                        rec.created_at.to_rfc3339(),
                        rec.trigger,
                        rec.size_bytes,
                        rec.remote_ref.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(0)
        }
        BackupCommand::Health => {
            let health = open_store(&config)?.health()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(0)
        }
        BackupCommand::Prune { keep } => {
            let keep = keep.unwrap_or(config.schedule.retention_count);
            if keep == 0 {
                anyhow::bail!("--keep must be at least 1");
            }
            let removed = open_store(&config)?.prune(keep)?;
            println!("removed {} backup(s)", removed.len());
            for id in removed {
                println!("  {id}");
            }
            Ok(0)
        }
    }
}

async fn run_restore(cmd: RestoreCommand, config: Config) -> Result<u8> {
    match cmd {
        RestoreCommand::Stage { backup_id } => {
            let system = BackupSystem::open(config)?;
            let result = system.coordinator.stage_restore(&backup_id).await;
            system.close();
            match result {
                Ok(intent) => {
                    println!(
                        "backup {} staged; it will be applied at next startup",
                        intent.target_backup_id
                    );
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("restore not staged: {e}");
                    Ok(stage_exit_code(&e))
                }
            }
        }
        RestoreCommand::Diagnose { json } => {
            // Diagnostics must work even when the catalog is broken.
            let store = open_store(&config).ok().map(Arc::new);
            let report = DiagnosticsReporter::new(&config, store).report();
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("could not encode report: {e}"),
                }
            } else {
                println!("{report}");
            }
            Ok(0)
        }
        RestoreCommand::EmergencyClear => {
            let report = EmergencyCleanup::new(&config).force_clear()?;
            if report.is_noop() {
                println!("nothing to clear");
            } else {
                println!(
                    "cleared: descriptor {}, {} staging entr(ies)",
                    if report.descriptor_removed { "removed" } else { "absent" },
                    report.staging_entries_removed
                );
            }
            Ok(0)
        }
        RestoreCommand::ApplyPending => {
            config.ensure_dirs()?;
            let outcome = StartupRestoreProcessor::new(&config).process_pending_restore()?;
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(0)
        }
    }
}

fn open_store(config: &Config) -> Result<BackupStore> {
    std::fs::create_dir_all(&config.backup.dir)?;
    Ok(BackupStore::from_config(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store_backup::OperationKind;

    #[test]
    fn test_stage_exit_codes() {
        let mismatch = BackupError::ChecksumMismatch {
            path: PathBuf::from("b.db"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(stage_exit_code(&mismatch), 2);
        assert_eq!(
            stage_exit_code(&BackupError::RestoreAlreadyPending {
                backup_id: "b1".into()
            }),
            3
        );
        assert_eq!(stage_exit_code(&BackupError::NotFound("b9".into())), 1);
        assert_eq!(
            stage_exit_code(&BackupError::OperationInProgress(OperationKind::CreateBackup)),
            1
        );
    }

    #[test]
    fn test_cli_parses_commands() {
        let args = Args::try_parse_from(["store-backup", "restore", "stage", "b1"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Restore(RestoreCommand::Stage { ref backup_id }) if backup_id == "b1"
        ));

        let args = Args::try_parse_from(["store-backup", "backup", "list", "--limit", "3", "--json"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Backup(BackupCommand::List { limit: Some(3), json: true })
        ));

        let args = Args::try_parse_from(["store-backup", "restore", "emergency-clear"]).unwrap();
        assert!(matches!(args.command, Command::Restore(RestoreCommand::EmergencyClear)));
    }
}
