//! Backup Engine - command-line entry point
//!
//! Loads configuration, opens the engine and runs one operation.

use anyhow::{bail, Context, Result};
use backup_engine::{
    config::EngineConfig, daemon::shutdown::ShutdownCoordinator, models::backup_job::NewBackupJob,
    utils, Engine,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a configuration file with default values
    InitConfig {
        #[arg(default_value = "backup-engine.toml")]
        path: PathBuf,

        /// Data directory to put in the file
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Manage backup jobs
    Job {
        #[command(subcommand)]
        action: JobCommand,
    },

    /// Run a job once
    Run { job_id: String },

    /// Restore a backup into a directory
    Restore {
        backup_id: String,
        target: PathBuf,

        /// Key or key prefix to restore (repeatable); everything when omitted
        #[arg(long = "file")]
        files: Vec<String>,

        /// Only list what would be restored
        #[arg(long)]
        preview: bool,
    },

    /// Verify a backup against its signed manifest
    Verify {
        backup_id: String,

        /// Copy damaged files back from this directory
        #[arg(long, value_name = "DIR")]
        repair_from: Option<PathBuf>,
    },

    /// Jobs, running work and recent runs
    Status { job_id: Option<String> },

    /// Verification and index health
    Health,

    /// Check that a configured replication destination is reachable
    TestDestination { name: String },
}

#[derive(Subcommand, Debug)]
enum JobCommand {
    Create {
        name: String,

        /// Directory or file to back up (repeatable)
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        /// Root directory for backup output
        #[arg(long)]
        destination: String,

        /// Stored for an external scheduler
        #[arg(long)]
        schedule: Option<String>,

        /// Configured destination to replicate to (repeatable)
        #[arg(long = "replicate-to")]
        replicate_to: Vec<String>,

        #[arg(long, default_value_t = 30)]
        retention_days: i64,

        #[arg(long)]
        no_compression: bool,

        #[arg(long)]
        no_encryption: bool,

        #[arg(long)]
        no_dedup: bool,

        /// Always take full backups
        #[arg(long)]
        full_only: bool,

        #[arg(long)]
        no_verify: bool,
    },
    List,
    Show { id: String },
    Delete { id: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Command::InitConfig { path, data_dir, force } = &args.command {
        if path.exists() && !*force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        let config = match data_dir {
            Some(dir) => EngineConfig::with_data_dir(dir),
            None => EngineConfig::default(),
        };
        std::fs::write(path, config.to_toml()?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = EngineConfig::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));

    let engine = Engine::open(config).context("opening backup engine")?;
    let shutdown = ShutdownCoordinator::new();

    match args.command {
        Command::InitConfig { .. } => {}
        Command::Job { action } => match action {
            JobCommand::Create {
                name,
                sources,
                destination,
                schedule,
                replicate_to,
                retention_days,
                no_compression,
                no_encryption,
                no_dedup,
                full_only,
                no_verify,
            } => {
                let mut job = NewBackupJob::new(name, sources, destination);
                job.schedule = schedule;
                job.replication_destinations = replicate_to;
                job.retention_days = retention_days;
                job.compression = !no_compression;
                job.encryption = !no_encryption;
                job.dedup = !no_dedup;
                job.incremental = !full_only;
                job.verify_integrity = !no_verify;
                print_json(&engine.create_job(&job)?)?;
            }
            JobCommand::List => print_json(&engine.list_jobs()?)?,
            JobCommand::Show { id } => match engine.get_job(&id)? {
                Some(job) => {
                    print_json(&job)?;
                    print_json(&engine.list_runs(&id, 10)?)?;
                }
                None => bail!("job {} not found", id),
            },
            JobCommand::Delete { id } => {
                if !engine.delete_job(&id)? {
                    bail!("job {} not found", id);
                }
                println!("Job {} deleted", id);
            }
        },
        Command::Run { job_id } => {
            let result = engine.run_with_cancel(&job_id, shutdown.listen()).await;
            print_json(&result)?;
            if !result.success {
                bail!("backup failed: {}", result.error.unwrap_or_default());
            }
        }
        Command::Restore {
            backup_id,
            target,
            files,
            preview,
        } => {
            if preview {
                let selections = if files.is_empty() { vec![String::new()] } else { files };
                for source_path in selections {
                    print_json(&engine.preview_restore(&backup_id, &source_path)?)?;
                }
                return Ok(());
            }
            let selection = (!files.is_empty()).then_some(files);
            let result = engine
                .restore_with_cancel(&backup_id, &target, selection, &shutdown.listen())
                .await?;
            print_json(&result)?;
            if !result.success {
                bail!("restore finished with {} failed files", result.failed_files.len());
            }
        }
        Command::Verify {
            backup_id,
            repair_from,
        } => match repair_from {
            Some(source_dir) => {
                let result = engine.repair(&backup_id, &source_dir).await?;
                print_json(&result)?;
                if result.failed > 0 || !result.errors.is_empty() {
                    bail!("repair incomplete");
                }
            }
            None => {
                let result = engine.verify(&backup_id).await?;
                print_json(&result)?;
                if !result.success {
                    bail!("verification failed");
                }
            }
        },
        Command::Status { job_id } => print_json(&engine.status(job_id.as_deref())?)?,
        Command::Health => print_json(&engine.health()?)?,
        Command::TestDestination { name } => {
            engine.test_destination(&name).await?;
            println!("{}: reachable", name);
        }
    }

    Ok(())
}
