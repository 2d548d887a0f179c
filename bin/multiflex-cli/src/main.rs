//! Multiflex CLI - Container inspection tool
//!
//! This binary opens a single container file to show its identity, edit its
//! metadata and dump chunks as JSON lines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use multiflex_common::{Config, Encoding};
use multiflex_format::{Chunk, Track};
use multiflex_store::Store;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "multiflex")]
#[command(about = "Multiflex container tool")]
#[command(version)]
struct Args {
    /// Container file
    file: PathBuf,

    /// Configuration file (TOML)
    #[arg(short, long, env = "MULTIFLEX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show identity, schema version, epoch and latest timestamp
    Info,
    /// Create a container or migrate it to the current schema
    Init,
    /// Epoch operations
    Epoch {
        #[command(subcommand)]
        action: EpochCommands,
    },
    /// Metadata operations
    Meta {
        #[command(subcommand)]
        action: MetaCommands,
    },
    /// Print chunks with FIRST <= timestamp <= LAST, one JSON object per line
    Query {
        first: i64,
        last: i64,
        /// Include decoded field values
        #[arg(long)]
        values: bool,
    },
}

#[derive(Subcommand, Debug)]
enum EpochCommands {
    /// Show the epoch (-1 if unset)
    Get,
    /// Set the epoch (only once per container)
    Set {
        /// Epoch in microseconds
        micros: i64,
    },
}

#[derive(Subcommand, Debug)]
enum MetaCommands {
    /// Show a metadata value
    Get { key: String },
    /// Set a metadata value
    Put { key: String, value: String },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn open_store(path: &Path, config: &Config, writable: bool) -> Result<Store> {
    let store = Store::with_config(path, config.store.clone());
    store
        .open(writable)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(store)
}

/// Decoded values of one track as JSON
fn field_values(chunk: &Chunk, track: &Track) -> Result<Value> {
    let id = track.id();
    let value = match track.encoding() {
        Encoding::Binary => chunk.get_binary(id)?.map(|bytes| json!(hex::encode(bytes))),
        Encoding::Utf8String => chunk.get_text(id)?.map(Value::from),
        Encoding::Int32VarByte | Encoding::Int32DeltaVarByte => {
            chunk.get_integers(id)?.map(Value::from)
        }
        Encoding::None | Encoding::Int32CenterFiltered => None,
    };
    Ok(value.unwrap_or(Value::Null))
}

fn chunk_json(chunk: &Chunk, values: bool) -> Result<Value> {
    let mut tracks = Vec::with_capacity(chunk.descriptor().len());
    for track in chunk.descriptor().iter() {
        let mut entry = json!({
            "id": track.id(),
            "encoding": track.encoding().to_string(),
            "length": chunk.field_len(track.id())?,
        });
        if values {
            entry["values"] = field_values(chunk, track)?;
        }
        tracks.push(entry);
    }
    Ok(json!({
        "timestamp": chunk.timestamp(),
        "descriptor_id": chunk.descriptor().persisted_id(),
        "tracks": tracks,
    }))
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    // Command line level takes precedence over the config file
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("Container: {}", args.file.display());

    match args.command {
        Commands::Info => {
            let store = open_store(&args.file, &config, false)?;
            let info = json!({
                "path": args.file.display().to_string(),
                "id": store.id().map(|id| id.to_string()),
                "version": store.version(),
                "epoch_micros": store.get_epoch()?,
                "max_timestamp": store.find_max_timestamp()?,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Init => {
            let store = open_store(&args.file, &config, true)?;
            if let Some(id) = store.id() {
                println!("{id}");
            }
        }
        Commands::Epoch { action } => match action {
            EpochCommands::Get => {
                let store = open_store(&args.file, &config, false)?;
                println!("{}", store.get_epoch()?);
            }
            EpochCommands::Set { micros } => {
                let store = open_store(&args.file, &config, true)?;
                store.set_epoch(micros)?;
            }
        },
        Commands::Meta { action } => match action {
            MetaCommands::Get { key } => {
                let store = open_store(&args.file, &config, false)?;
                match store.get_meta(&key)? {
                    Some(value) => println!("{value}"),
                    None => anyhow::bail!("no value for key {key}"),
                }
            }
            MetaCommands::Put { key, value } => {
                let store = open_store(&args.file, &config, true)?;
                store.put_meta(&key, &value)?;
            }
        },
        Commands::Query {
            first,
            last,
            values,
        } => {
            let store = open_store(&args.file, &config, false)?;
            for chunk in store.find_by_timestamp_range(first, last)? {
                println!("{}", chunk_json(&chunk, values)?);
            }
        }
    }

    Ok(())
}
