//! FlashKV CLI - pool administration over device files
//!
//! Formats pools and shards, prints the on-disk state and runs crash
//! recovery offline.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use flashkv_common::config::DeviceConfig;
use flashkv_common::{EngineConfig, ShardFlags, ShardId};
use flashkv_storage::{BlobScope, RecoveryEngine, RecoveryReport, ShardProperties, protocol_version};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "flashkv-cli")]
#[command(about = "FlashKV pool administration")]
#[command(version)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, default_value = "/etc/flashkv/engine.toml")]
    config: PathBuf,

    /// Pool devices, overriding the configured list
    #[arg(short, long)]
    device: Vec<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a fresh superblock to every device
    Format {
        /// Create backing files of this size (e.g. 512M, 4G)
        #[arg(short, long)]
        size: Option<String>,
    },
    /// Show the superblock and shard slots
    Inspect,
    /// Create a shard in the lowest free slot
    FormatShard {
        /// Shard flags
        #[arg(short, long, value_enum, value_delimiter = ',', default_value = "persistent")]
        flags: Vec<FlagArg>,
        /// Shard quota (e.g. 64M, 1G)
        #[arg(short, long)]
        quota: String,
        /// Object-table capacity
        #[arg(short, long)]
        max_objects: u64,
        /// Container name
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// Replay a shard's logs into its object table
    Recover {
        /// Shard slot
        shard: u32,
    },
    /// Container metadata blobs
    Blob {
        #[command(subcommand)]
        action: BlobCommands,
    },
}

#[derive(Subcommand, Debug)]
enum BlobCommands {
    /// Print a blob as hex
    Get {
        /// Shard slot; the pool-wide blob when omitted
        #[arg(short, long)]
        shard: Option<u32>,
    },
    /// Store a hex-encoded blob
    Put {
        /// Shard slot; the pool-wide blob when omitted
        #[arg(short, long)]
        shard: Option<u32>,
        /// Blob contents as hex
        data: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlagArg {
    Persistent,
    Evicting,
    Replicated,
    CacheMode,
}

impl From<FlagArg> for ShardFlags {
    fn from(flag: FlagArg) -> Self {
        match flag {
            FlagArg::Persistent => Self::PERSISTENT,
            FlagArg::Evicting => Self::EVICTING,
            FlagArg::Replicated => Self::REPLICATED,
            FlagArg::CacheMode => Self::CACHE_MODE,
        }
    }
}

/// Parse a size string like "10G", "500M", "1T" into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        // Assume bytes if no suffix
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size out of range: '{s}'"))
}

/// Load the engine configuration, falling back to defaults when absent
fn load_config(path: &Path, devices: &[PathBuf]) -> Result<EngineConfig> {
    let mut config: EngineConfig = if path.exists() {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        EngineConfig::default()
    };
    if !devices.is_empty() {
        config.devices = devices
            .iter()
            .map(|path| DeviceConfig {
                path: path.clone(),
                direct_io: config.devices.first().is_none_or(|d| d.direct_io),
            })
            .collect();
    }
    if config.devices.is_empty() {
        bail!("no devices given; pass --device or list them in {}", path.display());
    }
    config.validate()?;
    Ok(config)
}

fn open_engine(config: EngineConfig) -> Result<RecoveryEngine> {
    let devices = RecoveryEngine::open_devices(&config, None)?;
    Ok(RecoveryEngine::open(config, devices)?)
}

fn properties_json(props: &ShardProperties) -> serde_json::Value {
    json!({
        "shard": props.shard_id.get(),
        "flags": format!("{:?}", props.flags),
        "state": props.state.to_string(),
        "quota_bytes": props.quota_bytes,
        "max_objects": props.max_objects,
        "container": props.container_name,
        "backup_seqno": props.backup_seqno,
        "restore_seqno": props.restore_seqno,
        "retained_seqno": props.retained_seqno,
        "write_epoch": props.write_epoch,
    })
}

fn report_json(report: &RecoveryReport) -> serde_json::Value {
    json!({
        "shard": report.shard.get(),
        "checkpoint_lsn": report.checkpoint_lsn,
        "highest_seqno": report.highest_seqno,
        "replayed_pages": report.replayed_pages,
        "replayed_records": report.replayed_records,
        "live_objects": report.live_objects,
        "tombstones": report.tombstones,
        "indexed": report.index.len(),
        "resume": {
            "log": report.resume.log.to_string(),
            "page": report.resume.page,
            "lsn": report.resume.lsn,
        },
    })
}

fn blob_scope(shard: Option<u32>) -> BlobScope {
    shard.map_or(BlobScope::Global, |id| BlobScope::Shard(ShardId::new(id)))
}

fn emit(json_output: bool, value: &serde_json::Value) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else if let Some(map) = value.as_object() {
        for (key, value) in map {
            println!("{key:<18} {value}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config, &args.device)?;
    info!("FlashKV CLI, protocol {}", protocol_version());

    match args.command {
        Commands::Format { size } => {
            let size = size.as_deref().map(parse_size).transpose()?;
            let devices = RecoveryEngine::open_devices(&config, size)?;
            let engine = RecoveryEngine::format(config, devices)?;
            let descriptor = engine.superblock().descriptor();
            emit(
                args.json,
                &json!({
                    "pool": descriptor.pool_uuid.to_string(),
                    "devices": descriptor.device_count,
                    "segments": descriptor.total_segments,
                    "segment_blocks": descriptor.segment_blocks,
                    "max_shards": descriptor.max_shards,
                }),
            )?;
            engine.shutdown()?;
        }
        Commands::Inspect => {
            let engine = open_engine(config)?;
            let superblock = engine.superblock();
            let descriptor = superblock.descriptor();
            let shards: Vec<_> = superblock.used_slots().iter().map(properties_json).collect();
            let global = superblock.read_global();
            emit(
                args.json,
                &json!({
                    "protocol": protocol_version(),
                    "pool": descriptor.pool_uuid.to_string(),
                    "version": descriptor.version,
                    "write_epoch": descriptor.write_epoch,
                    "devices": descriptor.device_count,
                    "device_blocks": descriptor.device_blocks,
                    "data_block": descriptor.data_block,
                    "segments": descriptor.total_segments,
                    "segment_blocks": descriptor.segment_blocks,
                    "align_blocks": descriptor.align_blocks,
                    "max_shards": descriptor.max_shards,
                    "global_blob_bytes": global.len(),
                    "repaired_copies": superblock
                        .stats()
                        .repaired_copies
                        .load(std::sync::atomic::Ordering::Relaxed),
                    "shards": shards,
                }),
            )?;
            engine.shutdown()?;
        }
        Commands::FormatShard {
            flags,
            quota,
            max_objects,
            name,
        } => {
            let flags = flags
                .into_iter()
                .fold(ShardFlags::empty(), |acc, flag| acc | ShardFlags::from(flag));
            let engine = open_engine(config)?;
            let id = engine.format_shard(flags, parse_size(&quota)?, max_objects, &name)?;
            let props = engine.shard_get_properties(id)?;
            emit(args.json, &properties_json(&props))?;
            engine.shutdown()?;
        }
        Commands::Recover { shard } => {
            let engine = open_engine(config)?;
            let id = ShardId::new(shard);
            let report = engine.recover_shard(id)?;
            emit(args.json, &report_json(&report))?;
            engine.close_shard(id)?;
            engine.shutdown()?;
        }
        Commands::Blob { action } => {
            let engine = open_engine(config)?;
            match action {
                BlobCommands::Get { shard } => {
                    let data = engine.container_meta_blob_get(blob_scope(shard))?;
                    println!("{}", hex::encode(data));
                }
                BlobCommands::Put { shard, data } => {
                    let bytes = hex::decode(data.trim()).context("blob is not valid hex")?;
                    engine.container_meta_blob_put(blob_scope(shard), &bytes)?;
                    println!("Stored {} bytes", bytes.len());
                }
            }
            engine.shutdown()?;
        }
    }

    Ok(())
}
