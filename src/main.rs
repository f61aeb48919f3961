use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

use bkp::hash::ObjectId;
use bkp::store::{DEFAULT_STORE_DIR, ObjectStore};
use bkp::{config, restore, show, snapshot};

/// A lightweight, space-efficient incremental file-level backup tool.
#[derive(Debug, Parser)]
#[command(name = "bkp")]
struct Args {
    /// Verbosity (-v, -vv, -vvv, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Where the object store lives.
    #[arg(short = 'C', long, default_value = DEFAULT_STORE_DIR)]
    store: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot the current directory.
    CreateSnapshot,
    /// List snapshots, most recent first.
    Snapshots {
        #[arg(default_value_t = 10)]
        limit: usize,
    },
    /// Restore a snapshot into an empty directory.
    RestoreSnapshot {
        snapshot: String,
        output: Utf8PathBuf,
        sub_path: Option<Utf8PathBuf>,
    },
    /// Dump an object's contents, whatever kind it turns out to be.
    ShowFile { object: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let config = config::load()?;
    let cwd = Utf8PathBuf::try_from(std::env::current_dir().context("Couldn't get the current directory")?)
        .context("Current directory isn't UTF-8")?
        .canonicalize_utf8()
        .context("Couldn't canonicalize the current directory")?;
    let store_dir = if args.store.is_absolute() {
        args.store.clone()
    } else {
        cwd.join(&args.store)
    };

    let store = Arc::new(ObjectStore::open(&store_dir, config.verify_on_read)?);

    match args.command {
        Command::CreateSnapshot => {
            let id = snapshot::create_snapshot(&store, &store_dir, &cwd, config.chunk_size as usize)?;
            println!("Created snapshot {id}");
        }
        Command::Snapshots { limit } => {
            info!(limit, "listing snapshots");
            let snapshots = snapshot::list_snapshots(&store, &store_dir, limit)?;
            if snapshots.is_empty() {
                println!("No snapshots yet.");
            }
            for (id, snapshot) in snapshots {
                println!("{id}  {}", snapshot.date);
            }
        }
        Command::RestoreSnapshot {
            snapshot,
            output,
            sub_path,
        } => {
            let id: ObjectId = snapshot.parse()?;
            restore::restore_snapshot(&store, &id, &output, sub_path.as_deref())?;
        }
        Command::ShowFile { object } => {
            let id: ObjectId = object.parse()?;
            show::show_file(&store, &id)?;
        }
    }

    Ok(())
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
