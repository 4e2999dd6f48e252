//! `la`: logic-analyzer command line.
//!
//! ```bash
//! la drivers
//! la detect --refresh
//! la capture --device /dev/ttyACM0 --channels 0,1,2 --frequency 10000000 \
//!     --pre 100 --post 900 --trigger-channel 0 --output capture.csv
//! la multi --device 192.168.4.1:4045 --device 192.168.4.2:4045 --channels 0,30
//! ```
//!
//! Ctrl-C during a capture requests a stop and waits for the completion.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod export;
mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use la_core::{CaptureCompletion, CaptureSession, ConnectionParams, SharedDriver};
use la_hardware::{DeviceDescriptor, HardwareConfig, HardwareDriverManager};
use logging::{LogFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "la")]
#[command(about = "Detect logic analyzers and run captures", long_about = None)]
struct Cli {
    /// Hardware configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format, overriding `[logging] format`
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered drivers and whether they can run here
    Drivers,

    /// Enumerate reachable devices
    Detect {
        /// Ignore cached results
        #[arg(long)]
        refresh: bool,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Capture from one device
    Capture {
        /// Connection string (port path, host:port, sigrok:<driver>, emulated)
        #[arg(long)]
        device: String,

        /// Registration id to use instead of automatic matching
        #[arg(long)]
        driver: Option<String>,

        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Synchronized capture across 2 to 5 devices; the first is the trigger master
    Multi {
        #[arg(long = "device", required = true)]
        devices: Vec<String>,

        #[command(flatten)]
        capture: CaptureArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct CaptureArgs {
    /// Channels to record, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    channels: Vec<u16>,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 1_000_000)]
    frequency: u64,

    #[arg(long, default_value_t = 100)]
    pre: u32,

    #[arg(long, default_value_t = 900)]
    post: u32,

    /// Edge trigger channel; no trigger when omitted
    #[arg(long)]
    trigger_channel: Option<u16>,

    /// Trigger on the falling edge
    #[arg(long, requires = "trigger_channel")]
    falling: bool,

    /// Extra trigger repetitions (burst mode)
    #[arg(long, default_value_t = 0)]
    loops: u32,

    /// Record burst boundaries
    #[arg(long)]
    measure_bursts: bool,

    /// Write samples to this CSV file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Give up waiting for the completion after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

impl CaptureArgs {
    fn session(&self) -> CaptureSession {
        let session = CaptureSession::new(self.frequency, self.pre, self.post)
            .with_channels(self.channels.iter().copied())
            .with_bursts(self.loops, self.measure_bursts);
        match self.trigger_channel {
            Some(channel) => session.with_edge_trigger(channel, self.falling),
            None => session.without_trigger(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = HardwareConfig::load(cli.config.as_deref())?;
    logging::init(&TracingConfig::from_logging_config(
        &config.logging,
        cli.log_format,
    )?)?;

    let manager = HardwareDriverManager::from_config(&config);
    let outcome = run(&cli, &manager).await;
    manager.dispose().await;
    outcome
}

async fn run(cli: &Cli, manager: &HardwareDriverManager) -> Result<()> {
    match &cli.command {
        Commands::Drivers => {
            println!("{:<18} {:>8}  {:<10} {:<10} NAME", "ID", "PRIORITY", "DEVICES", "AVAILABLE");
            for driver in manager.get_registered_drivers() {
                println!(
                    "{:<18} {:>8}  {:<10} {:<10} {}",
                    driver.id,
                    driver.priority,
                    driver.supported_devices.join(","),
                    if driver.is_available() { "yes" } else { "no" },
                    driver.name
                );
            }
        }
        Commands::Detect { refresh, json } => {
            let devices = manager.detect_hardware(!refresh).await;
            if *json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found");
            } else {
                for device in devices {
                    println!(
                        "{:<40} {:<10} {:>4.0}%  {}",
                        device.connection_string,
                        device.driver_type,
                        device.confidence * 100.0,
                        device.name
                    );
                }
            }
        }
        Commands::Capture {
            device,
            driver,
            capture,
        } => {
            let descriptor = DeviceDescriptor::from_connection_string(device);
            let driver = match driver {
                Some(id) => {
                    let instance = manager.create_driver_by_id(id, device)?;
                    instance
                        .connect(&ConnectionParams::default())
                        .await
                        .with_context(|| format!("Failed to connect to '{}'", device))?;
                    manager.track_connection(&descriptor.id, instance.clone());
                    instance
                }
                None => {
                    manager
                        .connect_device(&descriptor, &ConnectionParams::default())
                        .await?
                }
            };
            run_capture(driver, capture).await?;
        }
        Commands::Multi { devices, capture } => {
            let multi: SharedDriver = Arc::new(manager.create_multi_device_driver(devices)?);
            multi
                .connect(&ConnectionParams::default())
                .await
                .context("Failed to connect the device ensemble")?;
            manager.track_connection("multi", multi.clone());
            run_capture(multi, capture).await?;
        }
    }
    Ok(())
}

async fn run_capture(driver: SharedDriver, args: &CaptureArgs) -> Result<()> {
    tracing::info!(
        device = %driver.name(),
        channels = driver.channel_count(),
        max_frequency = driver.max_frequency(),
        "starting capture"
    );
    let handle = driver
        .start_capture(args.session())
        .await
        .map_err(|rejection| anyhow!("Capture rejected: {}", rejection.error))?;

    let wait = tokio::time::timeout(Duration::from_secs(args.timeout), handle.wait());
    tokio::pin!(wait);
    let finished = tokio::select! {
        done = &mut wait => Some(done),
        _ = tokio::signal::ctrl_c() => None,
    };
    let done = match finished {
        Some(done) => done,
        None => {
            tracing::warn!("interrupted, stopping capture");
            driver.stop_capture().await;
            wait.await
        }
    };
    let completion: CaptureCompletion =
        done.map_err(|_| anyhow!("No completion within {}s", args.timeout))??;

    if !completion.success {
        let reason = completion
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(anyhow!("Capture failed: {}", reason));
    }

    let session = &completion.session;
    for channel in &session.capture_channels {
        let samples = channel.samples.as_deref().unwrap_or_default();
        println!(
            "{:<14} {:>10} samples {:>8} transitions",
            channel.display_name(),
            samples.len(),
            export::transitions(samples)
        );
    }
    if let Some(bursts) = &session.bursts {
        println!("{} bursts", bursts.len());
    }
    if let Some(path) = &args.output {
        let rows = export::write_csv_file(session, path)?;
        println!("Wrote {} rows to {}", rows, path.display());
    }
    Ok(())
}
