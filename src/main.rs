//! ledgerwire - Talk to Ledger hardware signers over HID
//!
//! Lists attached devices, sends raw APDUs and drives the Aion application.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ledgerwire::app::{AionApp, MAX_OFFSET};
use ledgerwire::config::{self, Config};
use ledgerwire::device::{self, open_device};
use ledgerwire::discovery;
use ledgerwire::exchange::Session;
use ledgerwire::protocol::{self, from_hex, to_hex};

/// ledgerwire - APDU transport for Ledger hardware signers
#[derive(Parser)]
#[command(name = "ledgerwire")]
#[command(author = "ledgerwire contributors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange APDUs with Ledger hardware signers over HID", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices
    Devices {
        /// Show every HID device, not just matching ones
        #[arg(short, long)]
        all: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send a raw command APDU (hex) and print the response
    Exchange {
        /// Command APDU, e.g. e006000000
        apdu: String,
    },

    /// Fetch public keys and addresses from the Aion app
    Pubkey {
        /// First account offset
        #[arg(short, long, default_value_t = 0)]
        offset: u32,

        /// Number of consecutive accounts
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sign a hex payload with the Aion app
    Sign {
        /// Account offset
        #[arg(short, long, default_value_t = 0)]
        offset: u32,

        /// Payload to sign (hex)
        payload: String,
    },

    /// Show the Aion app configuration
    AppConfig,

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Devices { all, json } => {
            list_devices(&config, all, json)?;
        }
        Commands::Exchange { apdu } => {
            let command = from_hex(&apdu).context("invalid APDU")?;
            let session = open_session(&config)?;
            let result = session.exchange(&command).await;
            session.close().await?;
            println!("{}", to_hex(&result?));
        }
        Commands::Pubkey {
            offset,
            count,
            json,
        } => {
            let last = offset
                .checked_add(count.saturating_sub(1))
                .filter(|last| *last <= MAX_OFFSET)
                .with_context(|| format!("offsets must stay within {:#x}", MAX_OFFSET))?;

            let session = open_session(&config)?;
            let app = AionApp::new(&session);
            let mut keys = Vec::new();
            for offset in offset..=last {
                match app.public_key(offset).await {
                    Ok(key) => keys.push(key),
                    Err(e) => {
                        session.close().await?;
                        return Err(e.into());
                    }
                }
            }
            session.close().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else {
                for key in &keys {
                    println!("{}", key);
                }
            }
        }
        Commands::Sign { offset, payload } => {
            let payload = from_hex(&payload).context("invalid payload")?;
            let session = open_session(&config)?;
            let result = AionApp::new(&session).sign(offset, &payload).await;
            session.close().await?;
            println!("{}", to_hex(&result?));
        }
        Commands::AppConfig => {
            let session = open_session(&config)?;
            let result = AionApp::new(&session).app_configuration().await;
            session.close().await?;
            println!("{}", to_hex(&result?));
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info(&config);
        }
    }

    Ok(())
}

/// Open the configured device and wrap it in a session
fn open_session(config: &Config) -> anyhow::Result<Session> {
    let exchange_config = config.exchange_config()?;
    let transport = open_device(&config.matcher(), exchange_config.format.packet_size())?;
    tracing::debug!("Using {}", transport.describe());
    Ok(Session::new(transport, exchange_config))
}

/// Print attached devices
fn list_devices(config: &Config, all: bool, json: bool) -> anyhow::Result<()> {
    let matcher = config.matcher();
    let devices: Vec<_> = discovery::enumerate()?
        .into_iter()
        .filter(|info| all || matcher.matches(info))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    for info in &devices {
        let marker = if matcher.matches(info) { "*" } else { " " };
        println!("{} {}", marker, info);
    }
    Ok(())
}

/// Print system information
fn print_system_info(config: &Config) {
    println!("ledgerwire System Information");
    println!("=============================\n");

    println!("Platform: {}", device::platform_name());

    #[cfg(target_os = "linux")]
    {
        println!("\nLinux Requirements:");
        println!(
            "  - Read/write access to /dev/hidraw* for vendor {:04x} (udev rule)",
            config.device.vendor_id
        );
    }

    println!("\nPacket Size: {}", config.transport.packet_size);
    println!("Channel: {:#06x}", config.transport.channel);
    println!(
        "Framing: {}",
        if config.transport.ble { "BLE" } else { "HID" }
    );
    println!("APDU Tag: {:#04x}", protocol::TAG_APDU);
    println!(
        "Glitch Recovery: backoff after {}, give up after {}",
        config.recovery.backoff_after, config.recovery.max_glitches
    );
}
