pub mod metrics;
pub mod server;

pub use metrics::InverterMetrics;
pub use server::MetricsServer;

use crate::coordinator::{InverterHandle, PollUpdate};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Refresh `metrics` from a diagnostics snapshot after every poll cycle or write.
pub async fn follow(
    handle: InverterHandle,
    metrics: Arc<InverterMetrics>,
    cancel: CancellationToken,
) {
    let mut updates = handle.subscribe();
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => update,
        };
        match update {
            Ok(PollUpdate::CycleComplete(_) | PollUpdate::Written { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Metrics fell {} updates behind", skipped);
            }
            Err(RecvError::Closed) => break,
        }
        match handle.diagnostics().await {
            Ok(diagnostics) => metrics.update(&diagnostics),
            Err(e) => {
                tracing::debug!("Metrics follower stopping: {}", e);
                break;
            }
        }
    }
}
