use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use vring_blk::devices::virtio_blk::{create_region_file, BackendOptions, VirtioBlkBackend};
use vring_blk::{load_config, BlockDeviceClient, ClientConfig, DeviceConfig, BLOCK_SIZE, SECTOR_SIZE};

/// Drive a virtio-blk device through its memory-mapped split ring.
#[derive(Parser, Debug)]
#[command(name = "vblk", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Device file exposing the shared region.
    #[arg(long, env = "VBLK_DEVICE", global = true)]
    device: Option<PathBuf>,

    /// JSON or YAML client configuration; flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ring size agreed with the device.
    #[arg(long, global = true)]
    queue_size: Option<u16>,

    /// Completion timeout, e.g. "500ms" or "5s".
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    timeout: Option<Duration>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the device configuration header.
    Info,

    /// Read sectors and write them to stdout or a file.
    Read {
        #[arg(long)]
        sector: u64,
        /// Number of sectors.
        #[arg(long, default_value_t = 1)]
        count: u64,
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Write a file (padded to whole sectors) starting at a sector.
    Write {
        #[arg(long)]
        sector: u64,
        #[arg(long)]
        input: PathBuf,
    },

    /// Flush the device's write-back cache.
    Flush,

    /// Write and verify a pattern against an in-process backend.
    Selftest {
        /// Disk size in sectors.
        #[arg(long, default_value_t = 2048)]
        sectors: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(size) = cli.queue_size {
        config.queue_size = size;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout = timeout;
    }

    match cli.command {
        Command::Info => {
            let client = BlockDeviceClient::open(config)?;
            let dev = client.device_config();
            println!("device:     {}", client.device_path().display());
            println!(
                "capacity:   {} sectors ({} bytes)",
                dev.capacity_sectors,
                dev.capacity_sectors * SECTOR_SIZE as u64
            );
            println!("features:   {:#x}", dev.feature_flags);
            println!("flush:      {}", dev.has_feature(DeviceConfig::FEATURE_FLUSH));
            println!("queue size: {}", client.ring().size());
            client.close();
        }
        Command::Read {
            sector,
            count,
            output,
        } => {
            let mut client = BlockDeviceClient::open(config)?;
            let mut buf = vec![0u8; (count as usize) * SECTOR_SIZE];
            client.read_sectors(sector, &mut buf)?;
            client.close();
            match output {
                Some(path) => fs::write(path, &buf)?,
                None => io::stdout().write_all(&buf)?,
            }
        }
        Command::Write { sector, input } => {
            let mut data = fs::read(&input)?;
            let padded = data.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
            data.resize(padded.max(SECTOR_SIZE), 0);
            let mut client = BlockDeviceClient::open(config)?;
            client.write_sectors(sector, &data)?;
            client.close();
            info!("wrote {} sectors at {}", data.len() / SECTOR_SIZE, sector);
        }
        Command::Flush => {
            let mut client = BlockDeviceClient::open(config)?;
            client.flush()?;
            client.close();
        }
        Command::Selftest { sectors } => selftest(config, sectors)?,
    }

    Ok(())
}

fn selftest(mut config: ClientConfig, sectors: u64) -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let region = dir.path().join("region");
    let disk = dir.path().join("disk.img");
    fs::write(&disk, vec![0u8; sectors as usize * SECTOR_SIZE])?;
    create_region_file(
        &region,
        sectors,
        DeviceConfig::FEATURE_WRITE_BACK_CACHE | DeviceConfig::FEATURE_FLUSH,
        config.queue_size,
    )?;

    let backend = VirtioBlkBackend::new(&region, &disk, config.queue_size, BackendOptions::default())?
        .spawn()?;
    config.device = region;
    let mut client = BlockDeviceClient::open_with_signal(config, backend.signal())?;

    let span = (sectors as usize * SECTOR_SIZE).min(4 * BLOCK_SIZE);
    let pattern: Vec<u8> = (0..span).map(|i| (i % 251) as u8).collect();

    let start = Instant::now();
    client.write_sectors(0, &pattern)?;
    client.flush()?;
    let mut readback = vec![0u8; span];
    client.read_sectors(0, &mut readback)?;
    let elapsed = start.elapsed();

    if readback != pattern {
        return Err("selftest: read back data does not match".into());
    }
    info!(
        "selftest passed: {} bytes written and verified in {:?}, {} requests completed",
        span,
        elapsed,
        backend.completed()
    );
    client.close();
    Ok(())
}
