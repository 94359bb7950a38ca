//! `adapterctl`: command-line front end for the serial instrument adapters.
//!
//! Devices come from a TOML file (`--config`, default `adapters.toml`):
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [[devices]]
//! id = "slider"
//! type = "ell9"
//! config = { port = "/dev/ttyUSB0", channel = "0" }
//! ```
//!
//! Every device command initializes the adapter, performs one action and
//! shuts the adapter down again:
//!
//! ```bash
//! adapterctl get slider State
//! adapterctl set slider State 2
//! adapterctl busy slider
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use adapter_core::config::{load_config, AdaptersConfig, DeviceEntry};
use adapter_core::tracing_init::{self, parse_log_level, TracingConfig};
use adapter_core::{AdapterRegistry, DeviceAdapter, PropertyValue};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "adapterctl")]
#[command(about = "Drive serial instrument adapters from a device file", long_about = None)]
struct Cli {
    /// Device configuration file (TOML format)
    #[arg(long, short, default_value = "adapters.toml", global = true)]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// List the driver types this build knows about
    Drivers,

    /// List devices in the configuration file
    Devices,

    /// List serial ports present on this machine
    Ports,

    /// Initialize a device and print all its properties
    List {
        /// Device id from the configuration file
        device: String,
    },

    /// Read one property
    Get {
        /// Device id from the configuration file
        device: String,
        /// Property name, e.g. "State"
        property: String,
    },

    /// Write one property
    Set {
        /// Device id from the configuration file
        device: String,
        /// Property name, e.g. "State"
        property: String,
        /// New value, parsed according to the property's type
        value: String,
    },

    /// Ask whether the device is still executing its last command
    Busy {
        /// Device id from the configuration file
        device: String,
    },
}

/// Registry with every driver compiled into this binary.
fn build_registry() -> AdapterRegistry {
    adapter_driver_wpi::link();
    adapter_driver_pi::link();
    adapter_driver_thorlabs::link();
    adapter_driver_toptica::link();

    let mut registry = AdapterRegistry::new();
    registry.register_factory(Box::new(adapter_driver_wpi::AladdinFactory));
    registry.register_factory(Box::new(adapter_driver_pi::PiFocusLockFactory));
    registry.register_factory(Box::new(adapter_driver_thorlabs::Ell9Factory));
    registry.register_factory(Box::new(adapter_driver_toptica::IBeamSmartFactory));
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry = build_registry();

    // Drivers and ports do not need a configuration file.
    match &cli.command {
        Commands::Drivers => {
            init_tracing(&AdaptersConfig::default(), cli.log_level.as_deref())?;
            print_drivers(&registry);
            return Ok(());
        }
        Commands::Ports => {
            init_tracing(&AdaptersConfig::default(), cli.log_level.as_deref())?;
            return print_ports();
        }
        _ => {}
    }

    let config = load_config(&cli.config)?;
    init_tracing(&config, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Drivers | Commands::Ports => Ok(()),
        Commands::Devices => {
            print_devices(&config, &cli.config);
            Ok(())
        }
        Commands::List { device } => {
            let adapter = open_device(&registry, &config, &device).await?;
            let result = print_properties(adapter.as_ref()).await;
            finish(adapter.as_ref(), result).await
        }
        Commands::Get { device, property } => {
            let adapter = open_device(&registry, &config, &device).await?;
            let result = adapter
                .get_property(&property)
                .await
                .map(|value| println!("{}", value))
                .with_context(|| format!("Failed to read '{}' on '{}'", property, device));
            finish(adapter.as_ref(), result).await
        }
        Commands::Set {
            device,
            property,
            value,
        } => {
            let adapter = open_device(&registry, &config, &device).await?;
            let result = set_from_text(adapter.as_ref(), &property, &value)
                .await
                .with_context(|| format!("Failed to set '{}' on '{}'", property, device));
            finish(adapter.as_ref(), result).await
        }
        Commands::Busy { device } => {
            let adapter = open_device(&registry, &config, &device).await?;
            let result = adapter
                .busy()
                .await
                .map(|busy| println!("{}", busy))
                .with_context(|| format!("Busy query failed on '{}'", device));
            finish(adapter.as_ref(), result).await
        }
    }
}

fn init_tracing(config: &AdaptersConfig, level_override: Option<&str>) -> Result<()> {
    let mut tracing_config = TracingConfig::from_logging(&config.logging).map_err(|e| anyhow!(e))?;
    if let Some(level) = level_override {
        tracing_config.level = parse_log_level(level).map_err(|e| anyhow!(e))?;
    }
    tracing_init::init(tracing_config).map_err(|e| anyhow!(e))
}

// =============================================================================
// Listings
// =============================================================================

fn print_drivers(registry: &AdapterRegistry) {
    for driver_type in registry.driver_types() {
        if let Some(factory) = registry.factory(driver_type) {
            println!("{:<14} {}", driver_type, factory.name());
        }
    }
}

fn print_devices(config: &AdaptersConfig, path: &Path) {
    if config.devices.is_empty() {
        println!("No devices in {}", path.display());
        return;
    }
    for device in &config.devices {
        println!("{:<16} {}", device.id, device.driver_type);
    }
}

fn print_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let kind = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "usb {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "pci".to_string(),
            serialport::SerialPortType::BluetoothPort => "bluetooth".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{:<20} {}", port.port_name, kind);
    }
    Ok(())
}

async fn print_properties(adapter: &dyn DeviceAdapter) -> Result<()> {
    println!("{} ({})", adapter.name(), adapter.description());
    for info in adapter.properties().info() {
        let value = match adapter.get_property(&info.name).await {
            Ok(value) => value.to_string(),
            Err(e) => format!("<{}>", e),
        };
        let unit = info.unit.as_deref().unwrap_or("");
        println!(
            "  {:<18} {:<8} {:<10} {} {}  [{}]",
            info.name,
            info.kind,
            format!("{:?}", info.access),
            value,
            unit,
            info.domain
        );
    }
    Ok(())
}

// =============================================================================
// Device sessions
// =============================================================================

fn find_device<'a>(config: &'a AdaptersConfig, id: &str) -> Result<&'a DeviceEntry> {
    config.device(id).ok_or_else(|| {
        let known: Vec<&str> = config.devices.iter().map(|d| d.id.as_str()).collect();
        anyhow!("No device '{}' (configured: {})", id, known.join(", "))
    })
}

async fn open_device(
    registry: &AdapterRegistry,
    config: &AdaptersConfig,
    id: &str,
) -> Result<Arc<dyn DeviceAdapter>> {
    let entry = find_device(config, id)?;
    let adapter = registry
        .build(&entry.driver_type, entry.config.clone())
        .await
        .with_context(|| format!("Failed to build device '{}'", id))?;
    adapter
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize '{}' ({})", id, adapter.name()))?;
    info!(device = id, name = adapter.name(), "device initialized");
    Ok(adapter)
}

/// Shut the adapter down, keeping the action's error if there was one.
async fn finish(adapter: &dyn DeviceAdapter, result: Result<()>) -> Result<()> {
    let shutdown = adapter.shutdown().await;
    match (result, shutdown) {
        (Err(e), Err(shutdown_err)) => {
            warn!(error = %shutdown_err, "shutdown failed after command error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(e)) => Err(anyhow::Error::new(e).context("Shutdown failed")),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Parse `text` as the property's declared type, then write it.
async fn set_from_text(adapter: &dyn DeviceAdapter, property: &str, text: &str) -> Result<()> {
    let kind = adapter.properties().slot(property)?.kind();
    let value = PropertyValue::parse(kind, text)?;
    adapter.set_property(property, value.clone()).await?;
    info!(property, %value, "property set");
    Ok(())
}
