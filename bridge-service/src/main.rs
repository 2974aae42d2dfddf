use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_service::{
    backfill::BackfillEngine,
    config::AppConfig,
    live::{LiveIngestConnection, Notification},
    metrics_server, observability, shutdown,
    sinks::{QuestDbIlpWriter, QuestDbQuery},
    sources::{HttpFeedRelay, TibberHistoryClient},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let writer = Arc::new(
        QuestDbIlpWriter::connect(cfg.ilp_addr()?, cfg.ilp_options())
            .await
            .context("failed to connect to QuestDB ILP endpoint")?,
    );

    let stop = CancellationToken::new();
    shutdown::cancel_on_signal(stop.clone());

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            match notification {
                Notification::Status(state) => {
                    tracing::info!(status = %state, code = state.code(), "live connection status")
                }
                Notification::Processed(reading) => {
                    tracing::debug!(fields = reading.len(), "live reading stored")
                }
                Notification::Error(message) => tracing::warn!(error = %message, "live feed reported error"),
            }
        }
    });

    let feed = HttpFeedRelay::new(cfg.feed_relay_options());
    let mut live = LiveIngestConnection::new(feed, writer.clone(), cfg.measurement.clone(), notify_tx);

    let backfill = if cfg.backfill.enabled {
        let query = QuestDbQuery::connect(&cfg.questdb.uri, cfg.questdb.max_connections)
            .await
            .context("failed to connect to QuestDB pgwire endpoint")?;
        let api = TibberHistoryClient::new(
            cfg.tibber.query_url.clone(),
            cfg.tibber.access_token.clone(),
            cfg.request_timeout(),
        )?;
        let engine = BackfillEngine::new(api, query, writer.clone(), cfg.backfill_settings()?);
        let token = stop.child_token();
        Some(tokio::spawn(async move { engine.run(&token).await }))
    } else {
        tracing::info!("backfill disabled");
        None
    };

    live.connect().await?;
    let result = live.run(&stop).await;

    // Live loop ended: stop the backfill too.
    stop.cancel();
    if let Some(handle) = backfill {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "backfill task failed");
        }
    }

    live.close().await;
    result?;

    tracing::info!("bridge stopped");
    Ok(())
}
