/// Upstream block notifications
///
/// Two tasks: a websocket reader that subscribes to the node's event stream
/// and feeds `Block` events into a queue (plus the history rings), and a
/// consumer that turns those events into fresh jobs and `mining.notify`
/// broadcasts. Stale jobs are refreshed on a timer even when no block
/// arrives.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::pool::Pool;
use crate::stratum::commands;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
const QUEUE_POLL: Duration = Duration::from_secs(1);

/// Maintain the websocket subscription, reconnecting on transport failure.
pub async fn run_block_stream(pool: Arc<Pool>, block_tx: mpsc::UnboundedSender<Value>) {
    let url = pool.node.ws_url("/public/ws");
    let mut shutdown = pool.shutdown_signal();
    while !pool.is_shutdown() {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _response)) => {
                tracing::info!(%url, "websocket connected");
                loop {
                    let message = tokio::select! {
                        _ = shutdown.changed() => return,
                        message = stream.next() => message,
                    };
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_event(&pool, &block_tx, &text);
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("websocket closed by peer");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::warn!("websocket error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(%url, "websocket connect failed: {e}"),
        }
        if pool.is_shutdown() {
            return;
        }
        tracing::info!("websocket reconnect in {}s", RECONNECT_BACKOFF.as_secs());
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

fn handle_event(pool: &Pool, block_tx: &mpsc::UnboundedSender<Value>, text: &str) {
    let Ok(event) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("unparseable websocket event");
        return;
    };
    match event.get("cmd").and_then(Value::as_str) {
        Some("Block") => {
            let data = event.get("data").cloned().unwrap_or(Value::Null);
            pool.push_block_event(data.clone());
            let _ = block_tx.send(data);
        }
        Some("TX") => {
            pool.push_tx_event(event.get("data").cloned().unwrap_or(Value::Null));
        }
        other => tracing::debug!(?other, "ignored websocket event"),
    }
}

/// Drain the block queue: a new block force-renews every algorithm's job and
/// broadcasts with `clean = true`; on idle, jobs older than `job_span` are
/// refreshed without a template round-trip.
pub async fn run_job_refresh(pool: Arc<Pool>, mut block_rx: mpsc::UnboundedReceiver<Value>) {
    let job_span = Duration::from_secs(pool.config.job_span_secs);
    let algorithms = pool.config.algorithms();
    tracing::info!(?algorithms, "job refresh loop started");
    while !pool.is_shutdown() {
        match tokio::time::timeout(QUEUE_POLL, block_rx.recv()).await {
            Ok(Some(event)) => {
                for &algorithm in &algorithms {
                    match pool.add_new_job(algorithm, true).await {
                        Ok(job) => {
                            commands::broadcast_notify(&pool, &job, true);
                        }
                        Err(e) => tracing::warn!(%algorithm, "job renew failed: {e}"),
                    }
                }
                tracing::info!(
                    height = event.get("height").and_then(serde_json::Value::as_u64),
                    hash = event.get("hash").and_then(serde_json::Value::as_str),
                    "new block notified"
                );
            }
            Ok(None) => break, // stream task gone
            Err(_) => {
                // idle tick: keep jobs young
                for &algorithm in &algorithms {
                    let Some(best) = pool.jobs.best_job(algorithm) else { continue };
                    if best.age() < job_span {
                        continue;
                    }
                    match pool.add_new_job(algorithm, false).await {
                        Ok(job) => {
                            commands::broadcast_notify(&pool, &job, true);
                            tracing::debug!(%algorithm, job_id = job.job_id, "refreshed stale job");
                        }
                        Err(e) => tracing::warn!(%algorithm, "job refresh failed: {e}"),
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
    tracing::info!("job refresh loop closed");
}
