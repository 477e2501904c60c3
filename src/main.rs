//! emberdb command line tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emberdb::database::{Database, LOG_FILE_NAME};
use emberdb::storage::wal::{LogConfig, LogManager, LogReader};
use emberdb::DatabaseConfig;
use std::path::PathBuf;

/// emberdb storage engine tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty database directory
    Init {
        /// Data directory
        #[arg(short = 'D', long, default_value = "./emberdb_data")]
        data_dir: PathBuf,

        /// Buffer pool frames
        #[arg(short, long, default_value = "64")]
        pool_size: usize,
    },
    /// Open a database, run crash recovery and report what it did
    Recover {
        #[arg(short = 'D', long, default_value = "./emberdb_data")]
        data_dir: PathBuf,
    },
    /// Print every record in a database's log
    DumpLog {
        #[arg(short = 'D', long, default_value = "./emberdb_data")]
        data_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::Init {
            data_dir,
            pool_size,
        } => {
            let config = DatabaseConfig {
                pool_size,
                ..DatabaseConfig::default()
            };
            let db = Database::create(&data_dir, config).context("Failed to create database")?;
            db.close()?;
            println!("Created database at {}", data_dir.display());
        }
        Command::Recover { data_dir } => {
            let db = Database::open(&data_dir, DatabaseConfig::default())
                .context("Failed to open database")?;
            if let Some(stats) = db.recovery_stats() {
                println!("records scanned:   {}", stats.records_scanned);
                println!("records redone:    {}", stats.records_redone);
                println!("records undone:    {}", stats.records_undone);
                println!("CLRs written:      {}", stats.clrs_written);
                println!("losers:            {:?}", stats.loser_transactions);
                println!("max LSN:           {}", stats.max_lsn);
                match stats.max_txn_id {
                    Some(id) => println!("max transaction:   {}", id),
                    None => println!("max transaction:   none"),
                }
            }
            db.close()?;
        }
        Command::DumpLog { data_dir } => {
            let path = data_dir.join(LOG_FILE_NAME);
            if !path.exists() {
                anyhow::bail!("No log at {}", path.display());
            }
            let log_manager = LogManager::open(&path, LogConfig::default())?;
            let mut count = 0;
            for entry in LogReader::new(&log_manager) {
                let entry = entry?;
                println!("{:>10}  {}", entry.offset, entry.record);
                count += 1;
            }
            println!("{} records, {} bytes", count, log_manager.log_size());
        }
    }

    Ok(())
}
