#[path = "../bin_common.rs"]
mod common;

use clap::{Parser, Subcommand};
use common::{ConnectArgs, DEVICE_NAME_PREFIX, parse_register_address, print_readings};
use srne_ble::discover_devices;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "srne-query")]
#[command(about = "Query and configure SRNE inverters over Bluetooth LE")]
struct Args {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List nearby SRNE bridges
    Scan,
    /// Run one poll cycle and print register values
    Read {
        /// Registers to print (hex values like 0x0100 or decimal); all when empty
        #[arg(value_parser = parse_register_address)]
        addresses: Vec<u16>,
    },
    /// Write a setting and confirm it by reading it back
    Write {
        #[arg(value_parser = parse_register_address)]
        address: u16,
        /// Number in display units, or an option label for enumerated settings
        value: String,
    },
    /// Poll once and print the diagnostics snapshot as JSON
    Diagnostics,
    /// Forget registers previously found to be unsupported
    ClearFailed,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();
    let args = Args::parse();

    if let Command::Scan = args.command {
        let devices = discover_devices(DEVICE_NAME_PREFIX).await;
        if devices.is_empty() {
            eprintln!("No SRNE devices found");
            std::process::exit(1);
        }
        for device in &devices {
            println!(
                "  {} ({})",
                device.address,
                device.name.as_deref().unwrap_or("unknown")
            );
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    common::shutdown_on_ctrl_c(&cancel);
    let running = common::start(args.connect, &cancel).await?;
    let handle = running.handle.clone();

    let outcome: Result<(), Box<dyn std::error::Error>> = async {
        match args.command {
            Command::Scan => {}
            Command::Read { addresses } => {
                let report = handle.force_refresh().await?;
                tracing::info!(
                    "Cycle: {} fresh, {} stale in {:?}",
                    report.fresh,
                    report.stale,
                    report.duration
                );
                let readings = if addresses.is_empty() {
                    handle.read_all().await?
                } else {
                    let mut readings = BTreeMap::new();
                    for address in addresses {
                        readings.insert(address, handle.read(address).await?);
                    }
                    readings
                };
                print_readings(&running.table, &readings);
            }
            Command::Write { address, value } => {
                let descriptor = running
                    .table
                    .get(address)
                    .ok_or_else(|| format!("Unknown register 0x{address:04X}"))?;
                let value = descriptor.parse_value(&value)?;
                handle.write(address, value.clone()).await?;
                println!("0x{:04X} {} = {}", address, descriptor.name, value);
            }
            Command::Diagnostics => {
                handle.force_refresh().await?;
                let diagnostics = handle.diagnostics().await?;
                println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            }
            Command::ClearFailed => {
                let cleared = handle.clear_failed_registers().await?;
                println!("Cleared {cleared} unsupported register(s)");
            }
        }
        Ok(())
    }
    .await;

    cancel.cancel();
    running.task.await?;
    outcome
}
