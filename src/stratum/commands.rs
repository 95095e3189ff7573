/// Server-to-client stratum methods
///
/// Builders for `mining.notify`, `mining.set_difficulty`, `client.reconnect`
/// and `client.show_message`, plus the algorithm-wide notify broadcast.

use serde_json::{json, Value};

use crate::chain::hashing::{merkle_branch, swap_prev_hash};
use crate::jobs::Job;
use crate::pool::Pool;
use crate::stratum::session::Session;

/// `mining.notify` parameter list:
/// `[job_id, prev_hash, coinbase1, coinbase2, merkle_branch, version, bits,
/// ntime, clean]`, all hex except the flag.
pub fn notify_params(job: &Job, clean: bool) -> Value {
    let hashes: Vec<[u8; 32]> = job.unconfirmed.iter().map(|(hash, _)| *hash).collect();
    let branch: Vec<String> = merkle_branch(&hashes)
        .into_iter()
        .map(hex::encode)
        .collect();
    json!([
        hex::encode(job.job_id.to_be_bytes()),
        hex::encode(swap_prev_hash(&job.previous_hash)),
        hex::encode(&job.coinbase1),
        hex::encode(&job.coinbase2),
        branch,
        hex::encode(job.version.to_be_bytes()),
        hex::encode(job.bits),
        hex::encode(job.ntime.to_be_bytes()),
        clean,
    ])
}

/// Notify every session mining this job's algorithm. Returns the number of
/// sessions reached.
pub fn broadcast_notify(pool: &Pool, job: &Job, clean: bool) -> usize {
    let count = pool.broadcast("mining.notify", notify_params(job, clean), job.algorithm);
    tracing::debug!(job_id = job.job_id, clean, count, "broadcast mining.notify");
    count
}

/// Push the session's current difficulty.
pub fn set_difficulty(session: &Session) -> bool {
    let difficulty = session.state.lock().expect("session state poisoned").difficulty();
    session.send_request("mining.set_difficulty", json!([difficulty]))
}

/// Ask the miner to drop the line and come back after `wait` seconds.
pub fn reconnect(session: &Session, host: &str, port: u16) -> bool {
    session.send_request("client.reconnect", json!([host, port, 5]))
}

pub fn show_message(session: &Session, message: &str) -> bool {
    session.send_request("client.show_message", json!([message]))
}

/// Replace the subscription-time extranonce beginning with the next job.
pub fn set_extranonce(session: &Session, extranonce1: [u8; 4]) -> bool {
    session.send_request(
        "mining.set_extranonce",
        json!([hex::encode(extranonce1), 4]),
    )
}
