/// Periodic pool bookkeeping
///
/// Two independent timers: the distribution recorder snapshots per-algorithm
/// miner shares (feeding coinbase-split payouts and the dashboard history),
/// and the status recorder samples pool-wide worker counts and hashrates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::algorithm::Algorithm;
use crate::db::{self, epoch_now};
use crate::pool::Pool;

const HISTORY_LEN: usize = 50;
/// Miners plus the owner entry may not exceed one coinbase's output budget.
const MAX_OUTPUTS: usize = 255;
/// Network hashrate per difficulty unit, `max_target / base_target`.
pub const HASHRATE_FACTOR: f64 = 7_158_278.8;

/// One per-algorithm snapshot of `(address, ratio)` pairs summing to 1.0; the
/// leading `None` entry is the pool owner's cut.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub time: i64,
    pub algorithm: Algorithm,
    pub entries: Vec<(Option<String>, f64)>,
}

#[derive(Default)]
pub struct DistributionBook {
    inner: Mutex<VecDeque<Distribution>>,
}

impl DistributionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, distribution: Distribution) {
        let mut inner = self.inner.lock().expect("distribution ring poisoned");
        if inner.len() == HISTORY_LEN {
            inner.pop_front();
        }
        inner.push_back(distribution);
    }

    /// Most recent snapshot for `algorithm` with at least `min_entries`
    /// recipients; the coinbase rewriter wants two or more.
    pub fn latest_for(&self, algorithm: Algorithm, min_entries: usize) -> Option<Distribution> {
        let inner = self.inner.lock().expect("distribution ring poisoned");
        inner
            .iter()
            .rev()
            .find(|d| d.algorithm == algorithm && d.entries.len() >= min_entries)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("distribution ring poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool-wide sample for the status history ring.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub time: i64,
    pub workers: Vec<(Algorithm, usize)>,
    pub pool_hashrate: Vec<(Algorithm, u64)>,
    pub network_hashrate: Vec<(Algorithm, u64)>,
    pub span_share: f64,
}

/// Normalize per-account sums into a coinbase-ready distribution: cap the
/// recipient count (owner included), dropping the smallest shares first, then
/// rescale so the miners sum to `1 - owner_fee` behind the owner entry.
pub fn build_distribution(
    mut shares: Vec<(Option<String>, f64)>,
    owner_fee: f64,
) -> Vec<(Option<String>, f64)> {
    if shares.is_empty() {
        return vec![(None, 1.0)];
    }
    if shares.len() + 1 > MAX_OUTPUTS {
        shares.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        shares.truncate(MAX_OUTPUTS - 1);
    }
    let total: f64 = shares.iter().map(|(_, s)| s).sum::<f64>() / (1.0 - owner_fee);
    let mut entries: Vec<(Option<String>, f64)> = shares
        .into_iter()
        .map(|(address, share)| (address, share / total))
        .collect();
    entries.insert(0, (None, owner_fee));
    entries
}

pub async fn run_distribution_recorder(pool: std::sync::Arc<Pool>) {
    let span = Duration::from_secs(pool.config.job_span_secs);
    let window = pool.config.distribution_window_secs as f64;
    let owner_fee = pool.config.owner_fee;
    tracing::info!("distribution recorder started");
    while !pool.is_shutdown() {
        tokio::time::sleep(span).await;
        for algorithm in pool.config.algorithms() {
            let end = epoch_now();
            let begin = end - window;
            let result = pool
                .store
                .run(move |conn| {
                    let tx = conn.transaction_with_behavior(
                        rusqlite::TransactionBehavior::Exclusive,
                    )?;
                    let sums = db::distribution_shares(&tx, begin, end, algorithm)?;
                    let mut resolved = Vec::with_capacity(sums.len());
                    for (account_id, share) in sums {
                        resolved.push((db::account_id_to_address(&tx, account_id)?, share));
                    }
                    Ok(resolved)
                })
                .await;
            match result {
                Ok(shares) => {
                    let entries = build_distribution(shares, owner_fee);
                    tracing::debug!(%algorithm, entries = entries.len(), "recorded distribution");
                    pool.distributions.push(Distribution {
                        time: end as i64,
                        algorithm,
                        entries,
                    });
                }
                Err(e) => tracing::warn!(%algorithm, "distribution snapshot failed: {e}"),
            }
        }
    }
}

pub async fn run_status_recorder(pool: std::sync::Arc<Pool>) {
    let mut last_tick = epoch_now();
    tracing::info!("pool status recorder started");
    while !pool.is_shutdown() {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let now = epoch_now();

        let (begin, end) = (last_tick, now);
        let span_share = match pool
            .store
            .run(move |conn| db::total_unpaid_shares(conn, begin, end))
            .await
        {
            Ok(share) => share,
            Err(e) => {
                tracing::warn!("status share query failed: {e}");
                0.0
            }
        };
        last_tick = now;

        let mut workers: Vec<(Algorithm, usize)> = Vec::new();
        let mut pool_hashrate: Vec<(Algorithm, u64)> = Vec::new();
        for session in pool.sessions_snapshot() {
            let algorithm = session.algorithm;
            let coefficient = pool.config.coefficient(algorithm).unwrap_or(1.0);
            let rate = session.state.lock().expect("session state").hashrate(now, coefficient);
            match workers.iter_mut().find(|(a, _)| *a == algorithm) {
                Some((_, count)) => *count += 1,
                None => workers.push((algorithm, 1)),
            }
            match pool_hashrate.iter_mut().find(|(a, _)| *a == algorithm) {
                Some((_, sum)) => *sum += rate,
                None => pool_hashrate.push((algorithm, rate)),
            }
        }

        // newest block per algorithm drives the network estimate
        let mut network_hashrate: Vec<(Algorithm, u64)> = Vec::new();
        for event in pool.block_history_snapshot().into_iter().rev() {
            let Some(algorithm) = event
                .get("flag")
                .and_then(|f| f.as_u64())
                .and_then(|id| Algorithm::from_id(id as u32))
            else {
                continue;
            };
            if network_hashrate.iter().any(|(a, _)| *a == algorithm) {
                continue;
            }
            let difficulty = event.get("difficulty").and_then(|d| d.as_f64()).unwrap_or(0.0);
            network_hashrate.push((algorithm, (difficulty * HASHRATE_FACTOR) as u64));
        }

        pool.push_status(PoolStatus {
            time: now as i64,
            workers,
            pool_hashrate,
            network_hashrate,
            span_share,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_yields_owner_only() {
        assert_eq!(build_distribution(vec![], 0.05), vec![(None, 1.0)]);
    }

    #[test]
    fn distribution_sums_to_one_with_owner_first() {
        let shares = vec![
            (Some("a".to_string()), 3.0),
            (Some("b".to_string()), 1.0),
        ];
        let entries = build_distribution(shares, 0.05);
        assert_eq!(entries[0], (None, 0.05));
        let total: f64 = entries.iter().map(|(_, r)| r).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((entries[1].1 - 0.95 * 0.75).abs() < 1e-9);
        assert!((entries[2].1 - 0.95 * 0.25).abs() < 1e-9);
    }

    #[test]
    fn distribution_truncates_at_output_budget() {
        let shares: Vec<(Option<String>, f64)> = (0..400)
            .map(|i| (Some(format!("miner{i}")), 1.0 + i as f64))
            .collect();
        let entries = build_distribution(shares, 0.05);
        assert_eq!(entries.len(), MAX_OUTPUTS);
        assert_eq!(entries[0].0, None);
        // the smallest contributors were dropped, the largest kept
        assert!(entries.iter().any(|(a, _)| a.as_deref() == Some("miner399")));
        assert!(!entries.iter().any(|(a, _)| a.as_deref() == Some("miner0")));
        let total: f64 = entries.iter().map(|(_, r)| r).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ring_keeps_latest_matching_snapshot() {
        let book = DistributionBook::new();
        book.push(Distribution {
            time: 1,
            algorithm: Algorithm::Sha256d,
            entries: vec![(None, 1.0)],
        });
        book.push(Distribution {
            time: 2,
            algorithm: Algorithm::Sha256d,
            entries: vec![(None, 0.05), (Some("a".into()), 0.95)],
        });
        book.push(Distribution {
            time: 3,
            algorithm: Algorithm::Scrypt,
            entries: vec![(None, 1.0)],
        });

        let found = book.latest_for(Algorithm::Sha256d, 2).unwrap();
        assert_eq!(found.time, 2);
        assert!(book.latest_for(Algorithm::Blake3, 1).is_none());
        assert!(book.latest_for(Algorithm::Scrypt, 2).is_none());
    }
}
