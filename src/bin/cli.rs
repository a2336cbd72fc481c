//! CinderKV CLI
//!
//! Command-line interface operating on a local CinderKV database.

use clap::{Parser, Subcommand};
use cinderkv::{CommitMode, Config, Database, IterOptions, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// CinderKV CLI
#[derive(Parser, Debug)]
#[command(name = "cinderkv-cli")]
#[command(about = "CLI for the CinderKV embedded key-value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./cinderkv_data")]
    data_dir: String,

    /// Database name (file name prefix)
    #[arg(short, long, default_value = "cinder")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// List entries in key order (or sequence order with --by-seq)
    Scan {
        /// Inclusive start key
        #[arg(long)]
        start: Option<String>,

        /// Exclusive end key
        #[arg(long)]
        end: Option<String>,

        /// Walk backwards
        #[arg(short, long)]
        reverse: bool,

        /// Order by sequence number instead of key
        #[arg(long)]
        by_seq: bool,

        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show database statistics
    Info,

    /// List retained headers
    Headers,

    /// Rewrite the database into a fresh generation
    Compact,

    /// Roll the database back to a sequence number
    Rollback {
        /// Target sequence number
        seq: u64,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .name(&args.name)
        .build();
    let db = Database::open(config)?;

    match args.command {
        Commands::Get { key } => match db.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            let seq = db.put(key.as_bytes(), value.as_bytes())?;
            db.commit(CommitMode::Normal)?;
            println!("OK (seq {})", seq);
        }
        Commands::Del { key } => {
            let existed = db.contains(key.as_bytes())?;
            db.delete(key.as_bytes())?;
            db.commit(CommitMode::Normal)?;
            println!("{}", if existed { "1" } else { "0" });
        }
        Commands::Scan {
            start,
            end,
            reverse,
            by_seq,
            limit,
        } => {
            let mut options = if by_seq {
                IterOptions::sequences()
            } else {
                IterOptions::keys()
            };
            if let Some(start) = start {
                options = options.start_key(start, true);
            }
            if let Some(end) = end {
                options = options.end_key(end, false);
            }
            if reverse {
                options = options.reverse();
            }
            let iter = db.iter(options)?;
            for entry in iter.take(limit.unwrap_or(usize::MAX)) {
                let entry = entry?;
                let value = entry.value.unwrap_or_default();
                println!(
                    "{:>8}  {} = {}",
                    entry.seq,
                    String::from_utf8_lossy(&entry.key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
        Commands::Info => {
            let info = db.info();
            println!("name:          {}", info.name);
            println!("generation:    {}", info.generation);
            println!("revision:      {}", info.revision);
            println!("seqnum:        {}", info.seqnum);
            println!("documents:     {}", info.ndocs);
            println!("data size:     {} bytes", info.datasize);
            println!("file size:     {} bytes", info.file_size);
        }
        Commands::Headers => {
            println!("{:>10} {:>10} {:>10} {:>12}  restorable", "revision", "seqnum", "index_seq", "block");
            for header in db.headers() {
                println!(
                    "{:>10} {:>10} {:>10} {:>12}  {}",
                    header.revision, header.seqnum, header.index_seq, header.bid, header.restorable
                );
            }
        }
        Commands::Compact => {
            let status = db.compact()?;
            println!("compacted {} documents", status.copied);
        }
        Commands::Rollback { seq } => {
            let revision = db.rollback(seq)?;
            println!("rolled back to seq {} (revision {})", seq, revision);
        }
    }

    db.close()
}
