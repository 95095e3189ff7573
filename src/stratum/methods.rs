/// Client-to-server stratum methods
///
/// Handlers return `Err` only for protocol violations that must drop the
/// connection; application-level failures answer a structured stratum error
/// and keep the session alive.

use std::sync::Arc;

use anyhow::{bail, Result};
use rand::RngCore;
use rusqlite::TransactionBehavior;
use serde_json::{json, Value};

use crate::chain::address::Address;
use crate::config::PayoutMethod;
use crate::db::{self, epoch_now};
use crate::pool::Pool;
use crate::stratum::commands;
use crate::stratum::protocol::{
    DUPLICATE_SHARE, JOB_NOT_FOUND, LOW_DIFFICULTY_SHARE, NOT_SUBSCRIBED, OTHER_UNKNOWN,
    UNAUTHORIZED_WORKER,
};
use crate::stratum::session::Session;
use crate::validator::check_submission;

pub async fn dispatch(
    pool: &Arc<Pool>,
    session: &Arc<Session>,
    method: &str,
    params: Vec<Value>,
    id: Value,
) -> Result<()> {
    match method {
        "mining.subscribe" => mining_subscribe(pool, session, params, id).await,
        "mining.authorize" => mining_authorize(pool, session, params, id).await,
        "mining.submit" => mining_submit(pool, session, params, id).await,
        "mining.get_transactions" => mining_get_transactions(pool, session, params, id),
        "mining.extranonce.subscribe" => {
            // capability acknowledgement only
            session.respond_ok(json!(true), id);
            Ok(())
        }
        "mining.suggest_difficulty" | "mining.suggest_target" => {
            // accepted by the protocol, not honoured by this pool
            session.respond_err(OTHER_UNKNOWN, id);
            Ok(())
        }
        other => {
            tracing::debug!(method = other, "unhandled stratum method");
            session.respond_err(OTHER_UNKNOWN, id);
            Ok(())
        }
    }
}

/// `mining.subscribe(version?, subscription_id?)`
///
/// A returning miner may present its old subscription id; the pool first
/// tries the recently-closed ring (carrying difficulty and pacing over),
/// then the store (extranonce only). Unknown ids drop the connection.
async fn mining_subscribe(
    pool: &Arc<Pool>,
    session: &Arc<Session>,
    params: Vec<Value>,
    id: Value,
) -> Result<()> {
    let version = match params.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    };
    let requested: Option<[u8; 32]> = params
        .get(1)
        .and_then(Value::as_str)
        .and_then(|s| hex::decode(s).ok())
        .and_then(|bytes| bytes.try_into().ok());

    session.state.lock().expect("session state poisoned").version = Some(version);

    match requested {
        None => {
            let mut extranonce1 = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut extranonce1);
            let subscription_id = pool
                .store
                .run(move |conn| {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let id = db::insert_new_subscription(&tx, &extranonce1)?;
                    tx.commit()?;
                    Ok(id)
                })
                .await?;
            let mut state = session.state.lock().expect("session state poisoned");
            state.extranonce1 = Some(extranonce1);
            state.subscription_id = Some(subscription_id);
        }
        Some(subscription_id) => {
            if let Some(old) = pool.resume_closed(&subscription_id, session.algorithm) {
                let mut state = session.state.lock().expect("session state poisoned");
                state.restore(&old);
                state.subscription_id = Some(subscription_id);
                tracing::debug!("resumed from disconnected session data");
            } else {
                let found = pool
                    .store
                    .run(move |conn| db::subscription_id_to_extranonce(conn, &subscription_id))
                    .await?;
                match found {
                    Some(extranonce1) => {
                        let mut state = session.state.lock().expect("session state poisoned");
                        state.extranonce1 = Some(extranonce1);
                        state.subscription_id = Some(subscription_id);
                        tracing::debug!("resumed subscription from store");
                    }
                    None => bail!("unknown subscription id"),
                }
            }
        }
    }

    let (subscription_id, extranonce1) = {
        let state = session.state.lock().expect("session state poisoned");
        match (state.subscription_id, state.extranonce1) {
            (Some(subscription_id), Some(extranonce1)) => (subscription_id, extranonce1),
            _ => bail!("subscription incomplete"),
        }
    };
    let sub_hex = hex::encode(subscription_id);
    let sub_hex = sub_hex.as_str();
    session.respond_ok(
        json!([
            [["mining.set_difficulty", sub_hex], ["mining.notify", sub_hex]],
            hex::encode(extranonce1),
            4,
        ]),
        id,
    );
    Ok(())
}

/// `mining.authorize(username, password)`
///
/// The username is a bech32 address. Every validation or infrastructure
/// failure answers a successful frame with `false` as the result; a class of
/// miners drops the connection on structured errors here.
async fn mining_authorize(
    pool: &Arc<Pool>,
    session: &Arc<Session>,
    params: Vec<Value>,
    id: Value,
) -> Result<()> {
    let (Some(username), Some(password)) = (
        params.first().and_then(Value::as_str),
        params.get(1).and_then(Value::as_str),
    ) else {
        session.respond_ok(json!(false), id);
        return Ok(());
    };

    if let Err(e) = Address::decode(username, &pool.config.bech32_hrp) {
        tracing::debug!(username, "wrong address format: {e}");
        session.respond_ok(json!(false), id);
        return Ok(());
    }

    {
        let mut state = session.state.lock().expect("session state poisoned");
        state.username = Some(username.to_string());
        state.password = Some(password.to_string());
    }

    let job = match pool.jobs.best_job(session.algorithm) {
        Some(job) => job,
        None => match pool.add_new_job(session.algorithm, false).await {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!("authorize failed, no job available: {e}");
                session.respond_ok(json!(false), id);
                return Ok(());
            }
        },
    };

    let address = username.to_string();
    let account_id = match pool
        .store
        .run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let account_id = db::address_to_account_id(&tx, &address, true)?;
            tx.commit()?;
            Ok(account_id)
        })
        .await
    {
        Ok(account_id) => account_id,
        Err(e) => {
            tracing::warn!("authorize account lookup failed: {e}");
            session.respond_ok(json!(false), id);
            return Ok(());
        }
    };
    session.state.lock().expect("session state poisoned").account_id = Some(account_id);

    commands::broadcast_notify(pool, &job, false);
    tracing::debug!(username, account_id, "authorize success");
    session.respond_ok(json!(true), id);
    Ok(())
}

/// `mining.get_transactions(job_id)`
fn mining_get_transactions(
    pool: &Arc<Pool>,
    session: &Arc<Session>,
    params: Vec<Value>,
    id: Value,
) -> Result<()> {
    let job = params
        .first()
        .and_then(Value::as_str)
        .and_then(parse_job_id)
        .and_then(|job_id| pool.jobs.get(job_id));
    match job {
        None => session.respond_err(JOB_NOT_FOUND, id),
        Some(job) => {
            let txs: Vec<String> = job
                .unconfirmed
                .iter()
                .map(|(hash, _)| {
                    let mut display = *hash;
                    display.reverse();
                    hex::encode(display)
                })
                .collect();
            session.respond_ok(json!(txs), id)
        }
    };
    Ok(())
}

/// `mining.submit(username, job_id, extranonce2, ntime, nonce)`
async fn mining_submit(
    pool: &Arc<Pool>,
    session: &Arc<Session>,
    params: Vec<Value>,
    id: Value,
) -> Result<()> {
    let Some((job_id, extranonce2, ntime, nonce)) = parse_submit_params(&params) else {
        session.respond_err(OTHER_UNKNOWN, id);
        return Ok(());
    };

    // pre-checks, cheapest first
    let (authorized, extranonce1, account_id, fixed_input, average_difficulty) = {
        let state = session.state.lock().expect("session state poisoned");
        (
            state.username.is_some(),
            state.extranonce1,
            state.account_id,
            state.min_difficulty(),
            state.average_difficulty(),
        )
    };
    if !authorized {
        session.respond_err(UNAUTHORIZED_WORKER, id);
        return Ok(());
    }
    let Some(extranonce1) = extranonce1 else {
        session.respond_err(NOT_SUBSCRIBED, id);
        return Ok(());
    };
    let Some(job) = pool.jobs.get(job_id) else {
        session.respond_err(JOB_NOT_FOUND, id);
        return Ok(());
    };
    if job.ntime != ntime {
        tracing::warn!(job_ntime = job.ntime, ntime, "submit with different time");
        session.respond_err(OTHER_UNKNOWN, id);
        return Ok(());
    }
    let Some(coefficient) = pool.config.coefficient(session.algorithm) else {
        tracing::warn!(algorithm = %session.algorithm, "algorithm missing from coefficient table");
        session.respond_err(OTHER_UNKNOWN, id);
        return Ok(());
    };

    let fixed_difficulty = fixed_input / coefficient;
    let submission = check_submission(&job, extranonce1, extranonce2, nonce, fixed_difficulty);
    if job.is_duplicate(&submission.block.hash) {
        session.respond_err(DUPLICATE_SHARE, id);
        return Ok(());
    }

    if !(submission.mined || submission.shared) {
        session.state.lock().expect("session state poisoned").n_reject += 1;
        session.respond_err(LOW_DIFFICULTY_SHARE, id);
        return Ok(());
    }

    {
        let mut state = session.state.lock().expect("session state poisoned");
        state.n_accept += 1;
        state.push_time_work(epoch_now(), average_difficulty);
    }
    job.record_submit(submission.block.hash);

    let mut mined = submission.mined;
    if mined {
        let payload = submission.payload.as_ref().expect("mined submissions carry a payload");
        match pool.node.submit_block(&hex::encode(payload), session.algorithm).await {
            Ok(response) if upstream_rejected(&response) => {
                mined = false;
                tracing::warn!("node rejected block: {response}");
            }
            Ok(_) => tracing::info!(
                algorithm = %session.algorithm,
                height = job.height,
                hash = %hex::encode(submission.block.hash),
                "mined a block"
            ),
            Err(e) => {
                mined = false;
                tracing::warn!("submitblock failed: {e}");
            }
        }
    } else {
        tracing::debug!(
            algorithm = %session.algorithm,
            height = job.height,
            "shared work"
        );
    }
    session.respond_ok(json!(true), id);

    // how much of the network target this share covered
    let share = average_difficulty / submission.block.difficulty() / coefficient;
    let blockhash = mined.then_some(submission.block.hash);
    let payout_id = match pool.config.payout_method {
        PayoutMethod::Transaction => 0,
        PayoutMethod::Coinbase => -1,
    };
    let Some(account_id) = account_id else {
        tracing::warn!("accepted share without account id, not recorded");
        return Ok(());
    };
    let algorithm = session.algorithm;
    let recorded = pool
        .store
        .run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            db::insert_new_share(&tx, account_id, algorithm, blockhash, share, payout_id)?;
            tx.commit()?;
            Ok(())
        })
        .await;
    if let Err(e) = recorded {
        tracing::warn!("share not recorded: {e}");
    }
    Ok(())
}

fn parse_job_id(hex_str: &str) -> Option<u32> {
    let bytes: [u8; 4] = hex::decode(hex_str).ok()?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn parse_submit_params(params: &[Value]) -> Option<(u32, [u8; 4], u32, [u8; 4])> {
    let job_id = parse_job_id(params.get(1)?.as_str()?)?;
    let extranonce2: [u8; 4] = hex::decode(params.get(2)?.as_str()?).ok()?.try_into().ok()?;
    let ntime_bytes: [u8; 4] = hex::decode(params.get(3)?.as_str()?).ok()?.try_into().ok()?;
    let mut nonce: [u8; 4] = hex::decode(params.get(4)?.as_str()?).ok()?.try_into().ok()?;
    nonce.reverse();
    Some((job_id, extranonce2, u32::from_be_bytes(ntime_bytes), nonce))
}

/// Any truthy `submitblock` result is a rejection notice.
fn upstream_rejected(response: &Value) -> bool {
    match response {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_params_parse_and_reverse_nonce() {
        let params = vec![
            json!("tb1qworker"),
            json!("0000002a"),
            json!("01020304"),
            json!("0019f0a0"),
            json!("aabbccdd"),
        ];
        let (job_id, extranonce2, ntime, nonce) = parse_submit_params(&params).unwrap();
        assert_eq!(job_id, 42);
        assert_eq!(extranonce2, [1, 2, 3, 4]);
        assert_eq!(ntime, 0x0019f0a0);
        assert_eq!(nonce, [0xdd, 0xcc, 0xbb, 0xaa]);
    }

    #[test]
    fn malformed_submit_params_rejected() {
        assert!(parse_submit_params(&[]).is_none());
        let short_nonce = vec![
            json!("u"),
            json!("0000002a"),
            json!("01020304"),
            json!("0019f0a0"),
            json!("aabb"),
        ];
        assert!(parse_submit_params(&short_nonce).is_none());
        assert!(parse_job_id("xyz").is_none());
        assert!(parse_job_id("00000001").is_some());
    }

    #[test]
    fn rejection_detection_follows_truthiness() {
        assert!(!upstream_rejected(&Value::Null));
        assert!(!upstream_rejected(&json!("")));
        assert!(!upstream_rejected(&json!(false)));
        assert!(upstream_rejected(&json!("high-hash")));
        assert!(upstream_rejected(&json!({"reason": "stale"})));
    }
}
