//! hci-transport-usb
//!
//! USB transport driver for a Bluetooth HCI radio. Picks a USB Bluetooth
//! controller, claims its HCI interface and relays HCI packets between the
//! radio and the controlling process over stdin/stdout.

mod config;
mod host;
mod worker;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{UsbCommand, bootstrap_logging, create_usb_bridge, setup_logging};
use config::DriverConfig;
use tracing::{error, info};
use transport::{Acceptance, RusbBackend, list_candidates};
use worker::spawn_usb_worker;

#[derive(Parser, Debug)]
#[command(name = "hci-transport-usb")]
#[command(
    author,
    version,
    about = "USB transport for a Bluetooth HCI radio"
)]
#[command(long_about = "
Relays HCI packets between a USB Bluetooth controller and the process that
started the driver. Packets are framed on stdin/stdout as
[length:2 big endian][type:1][payload]; logs go to stderr.

EXAMPLES:
    # Use the first Bluetooth radio found
    hci-transport-usb

    # Pick a radio by vendor and product ID
    hci-transport-usb open-by-vid-pid 0x0a12 0x0001

    # Pick a radio by its position on the bus
    hci-transport-usb open-by-bus 1 4

    # Show the radios that would be accepted
    hci-transport-usb --list-devices

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hci-usb/driver.toml
    3. /etc/hci-usb/driver.toml
    4. Built-in defaults
")]
struct Args {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List candidate Bluetooth radios and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// How to choose the radio
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Mode {
    /// Accept the radio with this vendor and product ID
    OpenByVidPid {
        #[arg(value_parser = parse_u16)]
        vid: u16,
        #[arg(value_parser = parse_u16)]
        pid: u16,
    },
    /// Accept the radio at this bus number and device address
    OpenByBus {
        #[arg(value_parser = parse_u8)]
        bus: u8,
        #[arg(value_parser = parse_u8)]
        address: u8,
    },
    /// Accept the first Bluetooth radio found
    First,
}

impl Mode {
    fn acceptance(&self) -> Acceptance {
        match *self {
            Mode::OpenByVidPid { vid, pid } => Acceptance::VidPid { vid, pid },
            Mode::OpenByBus { bus, address } => Acceptance::Location { bus, address },
            Mode::First => Acceptance::First,
        }
    }
}

/// Parse an unsigned number: `0x` prefix for hex, leading `0` for octal,
/// decimal otherwise
fn parse_number(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("invalid number '{}': {}", text, e))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    let value = parse_number(text)?;
    u16::try_from(value).map_err(|_| format!("{} does not fit in 16 bits", value))
}

fn parse_u8(text: &str) -> Result<u8, String> {
    let value = parse_number(text)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in 8 bits", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = {
        // Config loading logs before the configured subscriber exists
        let _startup_logs = bootstrap_logging(args.log_level.as_deref().unwrap_or("info"));
        if let Some(ref path) = args.config {
            DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
        } else {
            DriverConfig::load_or_default()
        }
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);

    let (usb_bridge, worker) = create_usb_bridge();

    // Listing writes plain text to stdout, so nothing is forwarded as frames
    let host_logs = (config.driver.forward_logs && !args.list_devices)
        .then(|| usb_bridge.report_sender());
    setup_logging(log_level, host_logs, config.driver.forward_debug)
        .context("Failed to setup logging")?;

    info!("hci-transport-usb v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices_mode();
    }

    let mode = args.mode.unwrap_or(Mode::First);
    let usb_worker_handle = spawn_usb_worker(worker, mode.acceptance(), &config)
        .context("Failed to spawn USB worker thread")?;

    let mut stdout = tokio::io::stdout();
    let result = host::run(std::io::stdin(), &mut stdout, &usb_bridge).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.send_command(UsbCommand::Shutdown).await {
        // Worker already gone
        info!("USB worker not listening: {}", e);
    }
    // The worker may be blocked sending into a full bridge
    drop(usb_bridge);
    usb_worker_handle
        .join()
        .map_err(|e| anyhow!("USB worker thread panicked: {:?}", e))?;

    result
}

/// List candidate radios and exit
fn list_devices_mode() -> Result<()> {
    let mut backend = RusbBackend::new();
    let candidates = list_candidates(&mut backend);

    if candidates.is_empty() {
        println!("No Bluetooth radios found.");
        return Ok(());
    }

    println!("Found {} Bluetooth radio(s):\n", candidates.len());
    for (device, interface) in candidates {
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}  HCI interface {}",
            device.vendor_id, device.product_id, device.bus_number, device.address, interface
        );
    }
    Ok(())
}
