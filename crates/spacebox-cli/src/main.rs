//! # spacebox CLI
//!
//! Operate a Spacebox data root from the command line.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spacebox_cas::{fingerprint_reader, ByteRange, Fs2Probe, PutOutcome, WINDOW_SIZE};
use spacebox_config::logging::{init_logging, LogLevel};
use spacebox_config::{log_cli_debug, Config};
use spacebox_service::{LogTransport, MemoryMetadata, Runtime, RuntimeOptions};

mod gc;
mod upload;

use gc::format_bytes;

/// Spacebox - deduplicated multi-disk object storage
#[derive(Parser)]
#[command(name = "spacebox")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data root holding the disk folders
    #[arg(long, global = true, env = "SPACEBOX_DATA_PATH")]
    data_root: Option<PathBuf>,

    /// Disk topology descriptor (disk_info.json)
    #[arg(long, global = true, env = "SPACEBOX_TOPOLOGY_FILE")]
    topology: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show free and total space per disk
    Disks,

    /// Print the fingerprint of a file
    Fingerprint {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Store a file directly, without a multipart task
    Put {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Read a stored object, optionally a byte range
    Get {
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: String,

        /// First byte to read
        #[arg(long)]
        start: Option<u64>,

        /// Last byte to read (inclusive); omitted reads to the end
        #[arg(long)]
        end: Option<u64>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload a file through the multipart flow, resuming if possible
    Upload {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Destination folder
        #[arg(long, default_value = "/")]
        folder: String,

        /// Bytes per part
        #[arg(long, default_value_t = WINDOW_SIZE)]
        part_size: u64,
    },

    /// List uploaded and in-flight parts of an upload
    Parts {
        #[arg(value_name = "UPLOAD_ID")]
        upload_id: String,
    },

    /// Abort an upload and delete its staging files
    Abort {
        #[arg(value_name = "UPLOAD_ID")]
        upload_id: String,
    },

    /// Collect expired upload tasks
    Gc(gc::GcArgs),

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the configuration file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(root) = cli.data_root {
        config.storage.data_root = root;
    }
    if let Some(topology) = cli.topology {
        config.storage.topology_file = Some(topology);
    }
    log_cli_debug!(
        "configuration loaded",
        data_root = tracing::field::display(config.storage.data_root.display())
    );

    match cli.command {
        Commands::Fingerprint { file } => {
            let size = file.metadata()?.len();
            let fp = fingerprint_reader(File::open(&file)?, size)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}  {}", fp, file.display());
            Ok(())
        }
        Commands::Config { command } => cmd_config(&config, command),
        Commands::Disks => with_runtime(&config, cmd_disks),
        Commands::Put { file } => with_runtime(&config, |rt| cmd_put(rt, &file)),
        Commands::Get {
            fingerprint,
            start,
            end,
            output,
        } => with_runtime(&config, |rt| {
            let range = match (start, end) {
                (None, None) => None,
                (start, None) => Some(ByteRange::to_eof(start.unwrap_or(0))),
                (start, Some(end)) => Some(ByteRange::inclusive(start.unwrap_or(0), end)),
            };
            cmd_get(rt, &fingerprint, range, output.as_deref())
        }),
        Commands::Upload {
            file,
            folder,
            part_size,
        } => with_runtime(&config, |rt| {
            let record = upload::run(&rt.service, &file, &folder, part_size)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }),
        Commands::Parts { upload_id } => with_runtime(&config, |rt| {
            let status = rt.service.list_uploaded_parts(&upload_id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }),
        Commands::Abort { upload_id } => with_runtime(&config, |rt| {
            if rt.service.delete_upload(&upload_id)? {
                println!("🗑️  Aborted upload {}", upload_id);
            } else {
                println!("No upload {}", upload_id);
            }
            Ok(())
        }),
        Commands::Gc(args) => with_runtime(&config, |rt| gc::run(&rt.manager, args)),
    }
}

/// Open the data root, run `f`, then stop background threads.
fn with_runtime<F>(config: &Config, f: F) -> Result<()>
where
    F: FnOnce(&Runtime) -> Result<()>,
{
    let options = RuntimeOptions {
        probe: Arc::new(Fs2Probe),
        transport: Arc::new(LogTransport),
        metadata: Arc::new(MemoryMetadata::new()),
        background: false,
    };
    let runtime = Runtime::with_options(config, options).with_context(|| {
        format!(
            "Failed to open data root {}",
            config.storage.data_root.display()
        )
    })?;
    let result = f(&runtime);
    runtime.shutdown();
    result
}

fn cmd_disks(runtime: &Runtime) -> Result<()> {
    println!();
    println!("  {:<6} {:<12} {:<12} PATH", "DISK", "FREE", "TOTAL");
    for usage in runtime.store.placer().disk_usage() {
        println!(
            "  {:<6} {:<12} {:<12} {}",
            usage.disk_id,
            format_bytes(usage.available),
            format_bytes(usage.total),
            usage.path.display()
        );
    }
    println!();
    Ok(())
}

fn cmd_put(runtime: &Runtime, file: &Path) -> Result<()> {
    let size = file.metadata()?.len();
    let key = fingerprint_reader(File::open(file)?, size)?.to_hex();
    let bucket = runtime.manager.bucket();
    match runtime.store.put(bucket, &key, File::open(file)?, size)? {
        PutOutcome::Stored { disk_id, path } => {
            println!("✅ Stored {} on disk {}: {}", key, disk_id, path.display())
        }
        PutOutcome::AlreadyExists { .. } => println!("✨ Already stored: {}", key),
    }
    Ok(())
}

fn cmd_get(
    runtime: &Runtime,
    fingerprint: &str,
    range: Option<ByteRange>,
    output: Option<&Path>,
) -> Result<()> {
    let mut reader = runtime.service.download_object(fingerprint, range)?;
    let copied = match output {
        Some(path) => {
            let mut out = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            io::copy(&mut reader, &mut out)?
        }
        None => {
            let mut out = io::stdout().lock();
            let copied = io::copy(&mut reader, &mut out)?;
            out.flush()?;
            copied
        }
    };
    log_cli_debug!("object read", key = fingerprint, bytes = copied);
    Ok(())
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("global: {}", path.display()),
                None => println!("global: (no home directory)"),
            }
            println!("local:  {}", Config::local_config_path().display());
            println!("topology: {}", config.storage.topology_path().display());
        }
    }
    Ok(())
}
