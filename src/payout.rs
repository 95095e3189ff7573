/// Payout scheduler
///
/// Runs in transaction payout mode only. Each cycle walks the unpaid mined
/// shares newest-first, keeps the ones buried deep enough in the chain,
/// totals their coinbase rewards, splits the post-fee amount across the
/// contributing accounts and settles with one `sendmany`. The payout row and
/// the share marking commit in a single store transaction; any earlier
/// failure just skips the cycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::TransactionBehavior;
use serde_json::{json, Value};

use crate::config::PayoutMethod;
use crate::db;
use crate::pool::Pool;

/// Per-account unpaid weight with its payout address.
pub struct AccountShare {
    pub account_id: i64,
    pub address: String,
    pub share: f64,
}

/// Split `total_send` across accounts proportionally to their share weight,
/// dropping anyone at or below `ignore_amount`. Returns the `(address,
/// coin_id, amount)` pairs for `sendmany` and the account ids they settle.
pub fn build_payout_pairs(
    shares: &[AccountShare],
    total_send: u64,
    ignore_amount: u64,
) -> (Vec<(String, u32, u64)>, Vec<i64>) {
    let total_share: f64 = shares.iter().map(|entry| entry.share).sum();
    if total_share <= 0.0 {
        return (Vec::new(), Vec::new());
    }
    let mut pairs = Vec::new();
    let mut paid_accounts = Vec::new();
    for entry in shares {
        let amount = (total_send as f64 * entry.share / total_share) as u64;
        if amount > ignore_amount {
            pairs.push((entry.address.clone(), 0u32, amount));
            paid_accounts.push(entry.account_id);
        } else {
            tracing::debug!(account_id = entry.account_id, amount, "below ignore amount");
        }
    }
    (pairs, paid_accounts)
}

pub async fn run(pool: Arc<Pool>) {
    if pool.config.payout_method != PayoutMethod::Transaction {
        tracing::info!("payout scheduler idle: coinbase payout mode");
        return;
    }
    let span = Duration::from_secs(pool.config.payout_check_span_secs);
    tracing::info!(span_secs = span.as_secs(), "payout scheduler started");
    while !pool.is_shutdown() {
        tokio::time::sleep(span).await;
        if pool.is_shutdown() {
            break;
        }
        tracing::info!("payout cycle start");
        if let Err(e) = run_cycle(&pool).await {
            tracing::warn!("payout cycle skipped: {e:#}");
        }
    }
}

async fn run_cycle(pool: &Arc<Pool>) -> Result<()> {
    let config = &pool.config;

    let chain_info = pool.node.get_chain_info().await?;
    let best_height = chain_info
        .pointer("/best/height")
        .and_then(Value::as_u64)
        .context("chain info missing best height")?;

    // candidate mined shares, newest first, stopping at the first paid row
    let candidates = pool.store.run(|conn| db::latest_mined_shares(conn)).await?;

    let mut total_mined: u64 = 0;
    let mut block_count = 0usize;
    let mut end: Option<f64> = None;
    for (ntime, blockhash) in candidates {
        let hash_hex = hex::encode(blockhash);
        let block = match pool.node.get_block_by_hash(&hash_hex).await {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(hash = %hash_hex, "orphan? node refused block lookup: {e}");
                continue;
            }
        };
        let height = block.get("height").and_then(Value::as_u64).unwrap_or(u64::MAX);
        if best_height.saturating_sub(config.min_confirm) < height {
            continue; // not buried deep enough yet
        }
        if end.is_none() {
            end = Some(ntime);
        }
        if block.get("f_orphan").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        let reward = block
            .pointer("/txs/0/outputs/0/2")
            .and_then(Value::as_u64)
            .context("block coinbase output missing amount")?;
        total_mined += reward;
        block_count += 1;
    }

    let total_send = (total_mined as f64 * (1.0 - config.owner_fee)) as u64;
    if total_send < config.min_amount {
        tracing::info!(total_send, min = config.min_amount, "too little mined, cycle skipped");
        return Ok(());
    }
    let Some(end) = end else {
        tracing::info!("no confirmed mined share, cycle skipped");
        return Ok(());
    };
    tracing::debug!(
        total_send,
        owner_cut = total_mined - total_send,
        block_count,
        "payout amounts settled"
    );

    // snapshot the unpaid window under an exclusive transaction
    let (begin, shares) = pool
        .store
        .run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            let begin = db::last_unpaid_time(&tx)?;
            let mut shares = Vec::new();
            for account_id in db::related_accounts(&tx, begin, end)? {
                let share = db::account_unpaid_shares(&tx, begin, end, account_id)?;
                let Some(address) = db::account_id_to_address(&tx, account_id)? else {
                    continue;
                };
                shares.push(crate::payout::AccountShare { account_id, address, share });
            }
            Ok((begin, shares))
        })
        .await?;
    tracing::debug!(begin, end, accounts = shares.len(), "payout window");

    let (pairs, paid_accounts) = build_payout_pairs(&shares, total_send, config.ignore_amount);
    if pairs.is_empty() {
        tracing::info!("no payout accounts, cycle skipped");
        return Ok(());
    }

    let result = pool.node.send_many(&json!(pairs)).await?;
    let txhash_hex = result
        .get("hash")
        .and_then(Value::as_str)
        .context("sendmany response missing hash")?;
    let txhash = hex::decode(txhash_hex).context("sendmany hash is not hex")?;
    tracing::info!(tx = txhash_hex, "payout sent");

    // the recording pair commits or rolls back together
    let (payout_id, rows) = pool
        .store
        .run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let payout_id = db::insert_new_payout(&tx, &txhash, total_send as i64, begin, end)?;
            let rows = db::update_shares_as_paid(&tx, payout_id, begin, end, &paid_accounts)?;
            tx.commit()?;
            Ok((payout_id, rows))
        })
        .await
        .map_err(|e| anyhow!("payout sent but not recorded, manual revert needed: {e}"))?;
    tracing::info!(payout_id, rows, "payout recorded");
    Ok(())
}
