//! Keeps the process alive exactly as long as its consumer.

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use veil_pipeline::ConsumerError;

/// Wait for either the consumer task to end or `shutdown` to resolve.
///
/// A consumer that ends on its own is always an error: it only returns after
/// a stop request, so anything else means it gave up on a partition. On
/// shutdown the consumer is told to stop and awaited so it can commit.
pub async fn supervise<F>(
    mut consumer: JoinHandle<Result<(), ConsumerError>>,
    stop: broadcast::Sender<()>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        finished = &mut consumer => {
            let result = match finished {
                Ok(Ok(())) => Err(anyhow!("Kafka consumer stopped without a shutdown request")),
                Ok(Err(e)) => Err(e).context("Kafka consumer failed"),
                Err(e) => Err(e).context("Consumer task failed"),
            };
            if let Err(e) = &result {
                error!(error = %format!("{:#}", e), "Consumer exited, stopping worker");
            }
            result
        }
        _ = shutdown => {
            info!("Shutting down worker");

            // The consumer commits its offsets before returning
            let _ = stop.send(());
            consumer
                .await
                .context("Consumer task failed")?
                .context("Kafka consumer failed")?;

            info!("Worker stopped");
            Ok(())
        }
    }
}
