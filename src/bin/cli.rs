//! caskdb CLI
//!
//! Opens a data directory directly and runs a single command against it.

use std::path::PathBuf;
use std::process::ExitCode;

use caskdb::{CaskError, Compression, Config, Engine, MergeTrigger, Recovery, SyncStrategy};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

/// caskdb CLI
#[derive(Parser, Debug)]
#[command(name = "caskdb-cli")]
#[command(about = "Command-line access to a caskdb data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./caskdb_data")]
    dir: PathBuf,

    /// Value compression the directory was written with
    #[arg(short, long, value_enum, default_value = "none")]
    compression: CompressionArg,

    /// Segment size in MB before rotation
    #[arg(short = 's', long, default_value = "64")]
    segment_mb: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompressionArg {
    None,
    Snappy,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Snappy => Compression::Snappy,
        }
    }
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

    /// Exit 0 if the key exists, 1 otherwise
    Has {
        /// The key to check
        key: String,
    },

    /// List all live keys
    Keys,

    /// Run a merge cycle now
    Merge,

    /// Replay every segment without modifying anything
    Check,

    /// Print engine counters
    Stats,
}

fn main() -> ExitCode {
    // Logs go to stderr so command output stays pipeable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,caskdb=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> caskdb::Result<ExitCode> {
    // Check never opens the engine, so it neither takes the lock nor repairs
    if let Commands::Check = args.command {
        let result = Recovery::verify(&args.dir)?;
        println!("segments:       {}", result.segments_scanned);
        println!("records:        {}", result.records_recovered);
        println!("tombstones:     {}", result.tombstones);
        println!("live keys:      {}", result.live_keys);
        println!("partial bytes:  {}", result.partial_bytes_dropped);
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::builder()
        .data_dir(&args.dir)
        .max_segment_size(args.segment_mb * 1024 * 1024)
        .sync_strategy(SyncStrategy::Manual)
        .merge_trigger(MergeTrigger::Disabled)
        .compression(args.compression.into())
        .build();

    let engine = Engine::open(config)?;
    let code = execute(&engine, args.command)?;
    engine.close()?;
    Ok(code)
}

fn execute(engine: &Engine, command: Commands) -> caskdb::Result<ExitCode> {
    match command {
        Commands::Get { key } => match engine.get(key.as_bytes()) {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(CaskError::KeyNotFound) => {
                println!("(nil)");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e),
        },
        Commands::Set { key, value } => {
            engine.set(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Del { key } => {
            engine.delete(key.as_bytes())?;
            println!("OK");
        }
        Commands::Has { key } => {
            let found = engine.has(key.as_bytes());
            println!("{}", found);
            if !found {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Keys => {
            let mut keys: Vec<Vec<u8>> = engine.keys().collect();
            keys.sort();
            for key in keys {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Commands::Merge => match engine.merge()? {
            Some(stats) => {
                println!("segments merged:   {}", stats.segments_merged);
                println!("records relocated: {}", stats.records_relocated);
                println!("records dropped:   {}", stats.records_dropped);
                println!("bytes reclaimed:   {}", stats.bytes_reclaimed());
            }
            None => println!("merge already in progress"),
        },
        Commands::Stats => {
            let stats = engine.stats();
            println!("live keys:        {}", stats.live_keys);
            println!("total records:    {}", stats.total_records);
            println!("dead records:     {}", stats.dead_records);
            println!("segments:         {}", engine.segment_ids()?.len());
            println!("sealed segments:  {}", stats.sealed_segments);
            if let Some(id) = stats.active_segment_id {
                println!("active segment:   {}", id);
            }
        }
        Commands::Check => unreachable!("handled before the engine is opened"),
    }

    Ok(ExitCode::SUCCESS)
}
