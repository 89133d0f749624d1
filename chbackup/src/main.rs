//! chbackup - main entry point

use anyhow::{Context, Result};
use chbackup::clickhouse::ClickHouseHttp;
use chbackup::daemon::ShutdownCoordinator;
use chbackup::transfer::progress::format_bytes;
use chbackup::{utils, Backuper, Config, UploadOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

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
    /// Upload a local backup to remote storage
    Upload {
        backup_name: String,

        /// Comma-separated `db.table` globs
        #[arg(short, long, default_value = "")]
        tables: String,

        /// Local backup to diff against
        #[arg(long, conflicts_with = "diff_from_remote")]
        diff_from: Option<String>,

        /// Remote backup to diff against
        #[arg(long)]
        diff_from_remote: Option<String>,

        /// Upload table definitions only
        #[arg(long)]
        schema: bool,

        /// Skip units finished by an interrupted earlier attempt
        #[arg(long)]
        resumable: bool,
    },

    /// List live tables of the server
    Tables {
        #[arg(short, long, default_value = "")]
        tables: String,
    },

    /// List backups on remote storage
    ListRemote,

    /// Print the default configuration
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("can't load config {}", path.display()))?,
        None => Config::from_env(),
    };

    if let Command::DefaultConfig = args.command {
        print!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let db = Arc::new(ClickHouseHttp::new(&config.clickhouse)?);
    let cancel = ShutdownCoordinator::new().spawn();
    let mut backuper = Backuper::new(config, db)
        .context("invalid configuration")?
        .with_cancel(cancel);

    match args.command {
        Command::Upload {
            backup_name,
            tables,
            diff_from,
            diff_from_remote,
            schema,
            resumable,
        } => {
            tracing::info!("Starting chbackup v{} upload of {}", env!("CARGO_PKG_VERSION"), backup_name);
            let opts = UploadOptions {
                backup_name: backup_name.clone(),
                tables,
                diff_from,
                diff_from_remote,
                schema_only: schema,
                resumable,
            };
            let summary = backuper
                .upload(opts)
                .await
                .with_context(|| format!("upload of {} failed", backup_name))?;
            println!("{}", summary);
        }
        Command::Tables { tables } => {
            for table in backuper.list_tables(&tables).await.context("can't list tables")? {
                let marker = if table.skip { "\tskip" } else { "" };
                println!(
                    "{}\t{}{}",
                    table.title(),
                    format_bytes(table.meta.total_bytes),
                    marker
                );
            }
        }
        Command::ListRemote => {
            for backup in backuper.list_remote().await.context("can't list remote backups")? {
                match (&backup.metadata, &backup.broken) {
                    (Some(meta), _) => println!(
                        "{}\t{}\t{}",
                        backup.name,
                        format_bytes(meta.total_size()),
                        meta.creation_date.format("%d/%m/%Y %H:%M:%S")
                    ),
                    (None, Some(reason)) => println!("{}\t???\t{}", backup.name, reason),
                    (None, None) => println!("{}", backup.name),
                }
            }
        }
        Command::DefaultConfig => {}
    }

    Ok(())
}
