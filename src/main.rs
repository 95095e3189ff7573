// Stratum pool server entry point
//
// Wiring order: config, store schema, pool value, then the long-running
// tasks (websocket stream, job refresh, stratum listeners, payout,
// recorders, store GC). Everything stops on the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use stratum_pool::config::Config;
use stratum_pool::db::Store;
use stratum_pool::node::NodeClient;
use stratum_pool::pool::Pool;
use stratum_pool::{notify, payout, recorder, stratum};

const GC_SPAN: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let config = Arc::new(Config::load()?);
    tracing::info!(
        rest_api = %config.rest_api,
        payout_method = ?config.payout_method,
        listeners = config.stratums.len(),
        "starting stratum pool"
    );

    let store = Store::new(&config.database_path);
    store.init_schema()?;

    let node = Arc::new(NodeClient::new(config.rest_api.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = Pool::new(config.clone(), store.clone(), node, shutdown_rx);

    // upstream notifications drive job generation and broadcast
    let (block_tx, block_rx) = mpsc::unbounded_channel();
    tokio::spawn(notify::run_block_stream(pool.clone(), block_tx));
    tokio::spawn(notify::run_job_refresh(pool.clone(), block_rx));

    // one listener per configured port/algorithm pair
    for stratum_cfg in &config.stratums {
        let pool = pool.clone();
        let stratum_cfg = stratum_cfg.clone();
        tokio::spawn(async move {
            if let Err(e) = stratum::serve(pool, stratum_cfg).await {
                tracing::error!("stratum listener failed: {e:#}");
            }
        });
    }

    tokio::spawn(payout::run(pool.clone()));
    tokio::spawn(recorder::run_distribution_recorder(pool.clone()));
    tokio::spawn(recorder::run_status_recorder(pool.clone()));

    // periodic retention cleanup
    {
        let store = store.clone();
        let retention = config.share_retention_secs;
        let pool = pool.clone();
        tokio::spawn(async move {
            while !pool.is_shutdown() {
                tokio::time::sleep(GC_SPAN).await;
                match tokio::task::spawn_blocking({
                    let store = store.clone();
                    move || store.cleanup(retention)
                })
                .await
                {
                    Ok(Ok((subs, shares))) if subs + shares > 0 => {
                        tracing::info!(subs, shares, "store cleanup")
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("store cleanup failed: {e}"),
                    Err(e) => tracing::warn!("store cleanup task failed: {e}"),
                }
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    // give the loops a moment to notice and close their sockets
    tokio::time::sleep(Duration::from_millis(500)).await;
    for session in pool.sessions_snapshot() {
        session.close();
    }
    tracing::info!("pool shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = ctrl_c => tracing::info!("SIGINT received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to register Ctrl+C handler");
        tracing::info!("Ctrl+C received");
    }
}
