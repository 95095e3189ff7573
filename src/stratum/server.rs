/// Stratum TCP server
///
/// One listener per configured `(port, algorithm)` pair; one handler task per
/// connection. The handler owns the read half and serializes request
/// handling, so a response is always written to the queue before the next
/// request is read. A separate writer task drains the outbound queue, which
/// is also where broadcasts land.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::StratumConfig;
use crate::pool::Pool;
use crate::stratum::commands;
use crate::stratum::methods;
use crate::stratum::protocol::RequestFrame;
use crate::stratum::session::Session;
use crate::vardiff;

/// 20 minutes of silence and the connection is gone.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(1200);
/// Some miners drop the line when a difficulty push arrives too early.
const FIRST_DIFFICULTY_DELAY: Duration = Duration::from_secs(5);

pub async fn serve(pool: Arc<Pool>, stratum: StratumConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", stratum.port)).await?;
    tracing::info!(
        port = stratum.port,
        algorithm = %stratum.algorithm,
        difficulty = stratum.difficulty,
        variable_diff = stratum.variable_diff,
        "stratum listener up"
    );
    let mut shutdown = pool.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let pool = pool.clone();
                let stratum = stratum.clone();
                tokio::spawn(async move {
                    handle_connection(pool, stratum, socket, peer).await;
                });
            }
        }
    }
    tracing::info!(port = stratum.port, "stratum listener closed");
    Ok(())
}

async fn handle_connection(
    pool: Arc<Pool>,
    stratum: StratumConfig,
    socket: TcpStream,
    peer: std::net::SocketAddr,
) {
    let (read_half, mut write_half) = socket.into_split();
    let (session, mut outbound_rx) = Session::new(
        stratum.algorithm,
        stratum.difficulty,
        stratum.submit_span,
        peer,
    );
    pool.register(session.clone());
    tracing::info!(%peer, algorithm = %stratum.algorithm, "new miner connected");

    let writer = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    if stratum.variable_diff {
        let pool = pool.clone();
        let session = session.clone();
        tokio::spawn(async move {
            vardiff::run(pool, session).await;
        });
    }
    {
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FIRST_DIFFICULTY_DELAY).await;
            if session.is_open() {
                commands::set_difficulty(&session);
            }
        });
    }

    read_loop(&pool, &session, &stratum, read_half).await;

    session.close();
    pool.unregister(&session);
    if let Some(closed) = session.to_closed() {
        pool.push_closed(closed);
    }
    // let the writer flush whatever is queued, then the socket drops
    let _ = writer.await;
    tracing::info!(%peer, "miner disconnected");
}

async fn read_loop(
    pool: &Arc<Pool>,
    session: &Arc<Session>,
    stratum: &StratumConfig,
    read_half: tokio::net::tcp::OwnedReadHalf,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    while session.is_open() && !pool.is_shutdown() {
        line.clear();
        match timeout(SOCKET_TIMEOUT, reader.read_line(&mut line)).await {
            Err(_) => {
                tracing::info!("socket read timeout");
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("socket read failed: {e}");
                return;
            }
            Ok(Ok(0)) => return, // peer closed
            Ok(Ok(_)) => {}
        }

        // a flooding miner gets pointed back at the same port and dropped
        let governed = {
            let state = session.state.lock().expect("session state poisoned");
            state.n_reject > 100 && state.n_accept < state.n_reject
        };
        if governed {
            commands::reconnect(session, &pool.config.host_name, stratum.port);
            tracing::debug!("reject governor tripped, asking miner to reconnect");
            return;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("malformed frame: {e}");
                return;
            }
        };
        let Some(method) = frame.method.as_ref().and_then(Value::as_str).map(str::to_owned)
        else {
            tracing::debug!("frame without a method string");
            return;
        };
        if !(method.starts_with("mining.") || method.starts_with("client.")) {
            tracing::debug!(method, "foreign method namespace");
            return;
        }

        let params = frame.params_array();
        tracing::debug!(method, id = %frame.id, "stratum request");
        if let Err(e) = methods::dispatch(pool, session, &method, params, frame.id).await {
            tracing::debug!("closing session: {e}");
            return;
        }
    }
}
