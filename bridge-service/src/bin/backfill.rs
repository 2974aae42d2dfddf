use anyhow::{Context, Result};
use bridge_service::{
    backfill::BackfillEngine,
    config::AppConfig,
    observability,
    pipeline::PointWriter,
    shutdown,
    sinks::{QuestDbIlpWriter, QuestDbQuery},
    sources::TibberHistoryClient,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Same configuration as the service; BACKFILL_ENABLED is ignored here.
    let cfg = AppConfig::load()?;

    let query = QuestDbQuery::connect(&cfg.questdb.uri, cfg.questdb.max_connections)
        .await
        .context("failed to connect to QuestDB pgwire endpoint")?;
    let writer = Arc::new(
        QuestDbIlpWriter::connect(cfg.ilp_addr()?, cfg.ilp_options())
            .await
            .context("failed to connect to QuestDB ILP endpoint")?,
    );
    let api = TibberHistoryClient::new(
        cfg.tibber.query_url.clone(),
        cfg.tibber.access_token.clone(),
        cfg.request_timeout(),
    )?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let engine = BackfillEngine::new(api, query, writer.clone(), cfg.backfill_settings()?);
    let summary = engine.run(&cancel).await;
    cancel.cancel();

    writer.close().await?;

    tracing::info!(
        pages = summary.pages,
        written = summary.written,
        skipped = summary.skipped,
        failed_requests = summary.failed_requests,
        failed_writes = summary.failed_writes,
        cancelled = summary.cancelled,
        "backfill finished"
    );

    Ok(())
}
