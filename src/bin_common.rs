use clap::Args;
use srne_ble::{
    BleLink, Coordinator, InverterConfig, InverterHandle, JsonFileStore, Reading, RegisterTable,
    discover_devices,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Advertised name prefix of SRNE BLE bridges.
pub const DEVICE_NAME_PREFIX: &str = "E6";

#[derive(Args)]
pub struct ConnectArgs {
    /// Inverter BLE MAC address. If not specified, discovers and uses the first SRNE bridge found.
    #[arg(short, long)]
    pub mac: Option<String>,

    /// Bluetooth adapter name
    #[arg(short, long, default_value = "hci0")]
    pub adapter: String,

    /// Inverter configuration (JSON); defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Register table (JSON); the built-in HF-series table is used when omitted
    #[arg(short, long)]
    pub registers: Option<PathBuf>,

    /// Where learned timeouts and unsupported registers are kept
    #[arg(short, long, default_value = "srne-state.json")]
    pub state: PathBuf,
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();
}

pub fn shutdown_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        cancel.cancel();
    });
}

async fn resolve_mac(mac: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(mac) = mac {
        return Ok(mac);
    }
    tracing::info!("Discovering SRNE devices...");
    let devices = discover_devices(DEVICE_NAME_PREFIX).await;
    for device in &devices {
        tracing::info!(
            "Found: {} ({})",
            device.name.as_deref().unwrap_or("unknown"),
            device.address
        );
    }
    // Bridges named E60* are the inverter itself rather than an accessory.
    let preferred = devices
        .iter()
        .find(|d| d.name.as_deref().is_some_and(|n| n.starts_with("E60")))
        .or(devices.first());
    match preferred {
        Some(device) => Ok(device.address.clone()),
        None => Err("No SRNE devices found. Specify a MAC address with --mac".into()),
    }
}

pub struct Running {
    pub handle: InverterHandle,
    pub task: JoinHandle<()>,
    #[allow(dead_code)]
    pub table: RegisterTable,
}

/// Build and start a coordinator for the inverter named by `args`.
pub async fn start(
    args: ConnectArgs,
    cancel: &CancellationToken,
) -> Result<Running, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => InverterConfig::load(path)?,
        None => InverterConfig::default(),
    };
    let table = match &args.registers {
        Some(path) => RegisterTable::load(path)?,
        None => RegisterTable::hf_series(),
    };
    tracing::info!("{} registers, polling every {:?}", table.len(), config.poll_interval());

    let mac_address = resolve_mac(args.mac).await?;
    tracing::info!("Using {} via {}", mac_address, args.adapter);
    let link = BleLink::by_address(&mac_address, &args.adapter);
    let store = Arc::new(JsonFileStore::new(args.state));

    let (coordinator, handle) =
        Coordinator::new(config, table.clone(), link, store, cancel.clone());
    Ok(Running {
        handle,
        task: coordinator.spawn(),
        table,
    })
}

#[allow(dead_code)]
pub fn parse_register_address(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

#[allow(dead_code)]
pub fn print_readings(table: &RegisterTable, readings: &BTreeMap<u16, Reading>) {
    println!("═══════════════════════════════════════════════════════════");
    println!("{:<8} {:<28} {:>12}  {}", "Register", "Name", "Value", "Status");
    println!("═══════════════════════════════════════════════════════════");
    for (address, reading) in readings {
        let (name, unit) = table.get(*address).map_or(("?", ""), |d| {
            (d.name.as_str(), d.unit.as_deref().unwrap_or(""))
        });
        let (value, status) = match reading {
            Reading::Fresh(v) => (format!("{v} {unit}"), ""),
            Reading::Stale(v) => (format!("{v} {unit}"), "stale"),
            Reading::Unavailable => ("-".to_string(), "unavailable"),
        };
        println!("0x{:04X}   {:<28} {:>12}  {}", address, name, value.trim_end(), status);
    }
    println!();
}
