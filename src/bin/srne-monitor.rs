#[path = "../bin_common.rs"]
mod common;

use clap::Parser;
use common::ConnectArgs;
use prometheus_client::registry::Registry;
use srne_ble::exporter::{self, InverterMetrics, MetricsServer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "srne-monitor")]
#[command(about = "Poll an SRNE inverter continuously and serve its metrics")]
struct Args {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Port for /metrics and /diagnostics endpoints
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    /// Disable the HTTP endpoints (log only)
    #[arg(long)]
    disable_pull: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();
    let args = Args::parse();

    let cancel = CancellationToken::new();
    common::shutdown_on_ctrl_c(&cancel);

    let running = common::start(args.connect, &cancel).await?;

    let metrics = Arc::new(InverterMetrics::default());
    let mut registry = Registry::default();
    metrics.register(&mut registry);
    let registry = Arc::new(registry);

    let mut handles = Vec::new();

    handles.push(tokio::spawn(exporter::follow(
        running.handle.clone(),
        metrics.clone(),
        cancel.clone(),
    )));

    if !args.disable_pull {
        let server = MetricsServer::new(
            registry.clone(),
            running.handle.clone(),
            args.metrics_port,
            cancel.clone(),
        );
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Metrics server error: {}", e);
            }
        }));
    }

    let mut updates = running.handle.subscribe();
    handles.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(srne_ble::PollUpdate::CycleComplete(report)) => {
                            if !report.newly_failed.is_empty() {
                                tracing::warn!(
                                    "Registers excluded as unsupported: {:04X?}",
                                    report.newly_failed
                                );
                            }
                        }
                        Ok(srne_ble::PollUpdate::Written { address, value }) => {
                            tracing::info!("0x{:04X} set to {}", address, value);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }));

    running.task.await.ok();
    for handle in handles {
        handle.await.ok();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
