/// Job cache & builder
///
/// Jobs are built from `getblocktemplate` and cached for five minutes under
/// monotonically increasing ids. A cache-wide builder lock serializes id
/// assignment and template fetches; the map itself sits behind a plain mutex
/// so lookups never suspend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::algorithm::Algorithm;
use crate::chain::address::Address;
use crate::chain::codec::{difficulty_from_bits, Tx};
use crate::config::{Config, PayoutMethod};
use crate::node::NodeClient;
use crate::recorder::DistributionBook;

const MAX_JOBS: usize = 2000;
const JOB_TTL: Duration = Duration::from_secs(300);
/// Byte length of the extranonce1 || extranonce2 slot at the coinbase tail.
pub const EXTRANONCE_SLOT: usize = 8;

pub struct Job {
    pub job_id: u32,
    pub previous_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    /// `(hash, raw)` pairs in template order, wire byte order hashes.
    pub unconfirmed: Vec<([u8; 32], Vec<u8>)>,
    pub version: u32,
    pub bits: [u8; 4],
    pub ntime: u32,
    pub height: u64,
    pub algorithm: Algorithm,
    submit_hashes: Mutex<Vec<[u8; 32]>>,
    created: Instant,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    fn new(
        job_id: u32,
        previous_hash: [u8; 32],
        coinbase: Vec<u8>,
        unconfirmed: Vec<([u8; 32], Vec<u8>)>,
        version: u32,
        bits: [u8; 4],
        ntime: u32,
        height: u64,
        algorithm: Algorithm,
    ) -> Self {
        let split = coinbase.len().saturating_sub(EXTRANONCE_SLOT);
        Self {
            job_id,
            previous_hash,
            coinbase1: coinbase[..split].to_vec(),
            coinbase2: Vec::new(),
            unconfirmed,
            version,
            bits,
            ntime,
            height,
            algorithm,
            submit_hashes: Mutex::new(Vec::new()),
            created: Instant::now(),
        }
    }

    pub fn bits_u32(&self) -> u32 {
        u32::from_be_bytes(self.bits)
    }

    /// Network difficulty implied by the compact bits.
    pub fn difficulty(&self) -> f64 {
        difficulty_from_bits(self.bits_u32())
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Per-job duplicate detection: has this block hash been submitted?
    pub fn is_duplicate(&self, hash: &[u8; 32]) -> bool {
        self.submit_hashes
            .lock()
            .expect("submit hash set poisoned")
            .contains(hash)
    }

    pub fn record_submit(&self, hash: [u8; 32]) {
        self.submit_hashes
            .lock()
            .expect("submit hash set poisoned")
            .push(hash);
    }
}

pub struct JobCache {
    jobs: Mutex<HashMap<u32, Arc<Job>>>,
    builder: tokio::sync::Mutex<()>,
    node: Arc<NodeClient>,
    config: Arc<Config>,
    distributions: Arc<DistributionBook>,
}

impl JobCache {
    pub fn new(
        node: Arc<NodeClient>,
        config: Arc<Config>,
        distributions: Arc<DistributionBook>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            builder: tokio::sync::Mutex::new(()),
            node,
            config,
            distributions,
        }
    }

    pub fn get(&self, job_id: u32) -> Option<Arc<Job>> {
        let jobs = self.jobs.lock().expect("job cache poisoned");
        jobs.get(&job_id)
            .filter(|job| job.age() < JOB_TTL)
            .cloned()
    }

    /// Most recently created live job for `algorithm`.
    pub fn best_job(&self, algorithm: Algorithm) -> Option<Arc<Job>> {
        let jobs = self.jobs.lock().expect("job cache poisoned");
        jobs.values()
            .filter(|job| job.algorithm == algorithm && job.age() < JOB_TTL)
            .min_by_key(|job| job.age())
            .cloned()
    }

    fn evict(&self) {
        let mut jobs = self.jobs.lock().expect("job cache poisoned");
        jobs.retain(|_, job| job.age() < JOB_TTL);
        while jobs.len() >= MAX_JOBS {
            let Some(oldest) = jobs
                .values()
                .max_by_key(|job| job.age())
                .map(|job| job.job_id)
            else {
                break;
            };
            jobs.remove(&oldest);
        }
    }

    /// Build a job for `algorithm`. `force_renew` (or a cold cache) fetches a
    /// fresh template from the node; otherwise the previous job is refreshed
    /// by rolling its timestamps forward.
    pub async fn add_new_job(&self, algorithm: Algorithm, force_renew: bool) -> Result<Arc<Job>> {
        let _serialize = self.builder.lock().await;
        self.evict();
        let job_id = {
            let jobs = self.jobs.lock().expect("job cache poisoned");
            jobs.keys().max().map_or(1, |max| max + 1)
        };
        let latest = self.best_job(algorithm);

        let job = if force_renew || latest.is_none() {
            let template = self.fetch_template(algorithm).await?;
            self.job_from_template(job_id, algorithm, &template)?
        } else {
            let latest = latest.expect("checked above");
            self.refresh_job(job_id, &latest)?
        };

        let job = Arc::new(job);
        self.jobs
            .lock()
            .expect("job cache poisoned")
            .insert(job_id, job.clone());
        tracing::debug!(
            job_id,
            %algorithm,
            height = job.height,
            txs = job.unconfirmed.len(),
            "new job"
        );
        Ok(job)
    }

    async fn fetch_template(&self, algorithm: Algorithm) -> Result<Value> {
        // a node mid-reorg may answer null; keep asking
        loop {
            let template = self.node.get_block_template(algorithm).await?;
            if !template.is_null() {
                return Ok(template);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn job_from_template(&self, job_id: u32, algorithm: Algorithm, template: &Value) -> Result<Job> {
        let previous_hash = {
            let mut hash = decode_hash32(
                template
                    .get("previousblockhash")
                    .and_then(Value::as_str)
                    .context("template missing previousblockhash")?,
            )?;
            hash.reverse();
            hash
        };
        let mut coinbase = hex::decode(
            template
                .pointer("/coinbasetxn/data")
                .and_then(Value::as_str)
                .context("template missing coinbasetxn.data")?,
        )?;

        if self.config.payout_method == PayoutMethod::Coinbase {
            if let Some(rewritten) = self.rewrite_coinbase(algorithm, &coinbase)? {
                coinbase = rewritten;
            }
        }

        let mut unconfirmed = Vec::new();
        if let Some(txs) = template.get("transactions").and_then(Value::as_array) {
            for tx in txs {
                let mut hash = decode_hash32(
                    tx.get("hash").and_then(Value::as_str).context("tx missing hash")?,
                )?;
                hash.reverse();
                let raw = hex::decode(
                    tx.get("data").and_then(Value::as_str).context("tx missing data")?,
                )?;
                unconfirmed.push((hash, raw));
            }
        }

        let version = template
            .get("version")
            .and_then(Value::as_u64)
            .context("template missing version")? as u32;
        let bits_raw = hex::decode(
            template.get("bits").and_then(Value::as_str).context("template missing bits")?,
        )?;
        let bits: [u8; 4] = bits_raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("bits must be 4 bytes"))?;
        let ntime = template
            .get("time")
            .and_then(Value::as_u64)
            .context("template missing time")? as u32;
        let height = template
            .get("height")
            .and_then(Value::as_u64)
            .context("template missing height")?;

        Ok(Job::new(
            job_id, previous_hash, coinbase, unconfirmed, version, bits, ntime, height, algorithm,
        ))
    }

    /// Coinbase-split payout: replace the template's outputs with the latest
    /// distribution snapshot, charging the extra-output fee to the reward.
    fn rewrite_coinbase(&self, algorithm: Algorithm, coinbase: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(dist) = self.distributions.latest_for(algorithm, 2) else {
            tracing::debug!(%algorithm, "no distribution data, coinbase kept");
            return Ok(None);
        };
        let mut tx = Tx::parse(coinbase)?;
        let first = tx
            .outputs
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("coinbase has no outputs"))?;
        let owner_address = first.address;
        let reward = first
            .amount
            .saturating_sub((dist.entries.len() as u64 - 1) * self.config.extra_output_fee);
        tx.outputs.clear();
        for (address, ratio) in &dist.entries {
            let address = match address {
                Some(s) => Address::decode(s, &self.config.bech32_hrp)?,
                None => owner_address,
            };
            tx.outputs.push(crate::chain::codec::TxOutput {
                address,
                coin_id: 0,
                amount: (reward as f64 * ratio) as u64,
            });
        }
        tracing::debug!(outputs = tx.outputs.len(), "rewrote coinbase outputs");
        Ok(Some(tx.serialize()))
    }

    /// Roll the previous job forward: bump ntime and the coinbase time &
    /// deadline by the wall-clock delta, keep everything else.
    fn refresh_job(&self, job_id: u32, latest: &Job) -> Result<Job> {
        let increase = latest.age().as_secs() as u32;
        let mut whole = latest.coinbase1.clone();
        whole.extend_from_slice(&[0u8; EXTRANONCE_SLOT]);
        whole.extend_from_slice(&latest.coinbase2);
        let mut coinbase_tx = Tx::parse(&whole)?;
        coinbase_tx.time = coinbase_tx.time.wrapping_add(increase);
        coinbase_tx.deadline = coinbase_tx.deadline.wrapping_add(increase);
        Ok(Job::new(
            job_id,
            latest.previous_hash,
            coinbase_tx.serialize(),
            latest.unconfirmed.clone(),
            latest.version,
            latest.bits,
            latest.ntime + increase,
            latest.height,
            latest.algorithm,
        ))
    }
}

fn decode_hash32(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("expected 32-byte hash, got {} bytes", bytes.len()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::address::IDENTIFIER_LEN;
    use crate::chain::codec::TxOutput;

    pub(crate) fn sample_coinbase(reward: u64) -> Vec<u8> {
        Tx {
            version: 2,
            tx_type: 1,
            time: 5_000,
            deadline: 15_800,
            inputs: vec![],
            outputs: vec![TxOutput {
                address: Address::new(0, [7u8; IDENTIFIER_LEN]),
                coin_id: 0,
                amount: reward,
            }],
            gas_price: 1,
            gas_amount: 0,
            message_type: 0,
            message: vec![0u8; EXTRANONCE_SLOT],
        }
        .serialize()
    }

    pub(crate) fn sample_job(job_id: u32, algorithm: Algorithm) -> Job {
        Job::new(
            job_id,
            [0x22; 32],
            sample_coinbase(5_000_000_000),
            vec![],
            2,
            0x207fffffu32.to_be_bytes(),
            1_700_000,
            42,
            algorithm,
        )
    }

    #[test]
    fn coinbase_split_invariant() {
        let coinbase = sample_coinbase(5_000_000_000);
        let job = sample_job(1, Algorithm::Sha256d);
        assert_eq!(job.coinbase1.len() + EXTRANONCE_SLOT, coinbase.len());
        assert!(job.coinbase2.is_empty());

        // reassembly with any extranonce bytes parses back to a transaction
        let mut patched = job.coinbase1.clone();
        patched.extend_from_slice(&[0xaa; EXTRANONCE_SLOT]);
        patched.extend_from_slice(&job.coinbase2);
        Tx::parse(&patched).unwrap();
    }

    #[test]
    fn duplicate_detection_is_per_job() {
        let job_a = sample_job(1, Algorithm::Sha256d);
        let job_b = sample_job(2, Algorithm::Sha256d);
        let hash = [9u8; 32];
        assert!(!job_a.is_duplicate(&hash));
        job_a.record_submit(hash);
        assert!(job_a.is_duplicate(&hash));
        assert!(!job_b.is_duplicate(&hash));
    }

    #[tokio::test]
    async fn refresh_rolls_time_forward() {
        let node = Arc::new(NodeClient::new("http://127.0.0.1:1"));
        let config = Arc::new(Config::default());
        let cache = JobCache::new(node, config, Arc::new(DistributionBook::new()));

        let latest = sample_job(1, Algorithm::Sha256d);
        let refreshed = cache.refresh_job(2, &latest).unwrap();
        assert_eq!(refreshed.job_id, 2);
        assert_eq!(refreshed.previous_hash, latest.previous_hash);
        assert_eq!(refreshed.height, latest.height);
        assert!(refreshed.ntime >= latest.ntime);
        // refreshed coinbase still splits at the extranonce slot
        let mut whole = refreshed.coinbase1.clone();
        whole.extend_from_slice(&[0u8; EXTRANONCE_SLOT]);
        let tx = Tx::parse(&whole).unwrap();
        assert!(tx.time >= 5_000);
    }

    #[test]
    fn best_job_prefers_newest() {
        let node = Arc::new(NodeClient::new("http://127.0.0.1:1"));
        let config = Arc::new(Config::default());
        let cache = JobCache::new(node, config, Arc::new(DistributionBook::new()));
        {
            let mut jobs = cache.jobs.lock().unwrap();
            jobs.insert(1, Arc::new(sample_job(1, Algorithm::Sha256d)));
            jobs.insert(2, Arc::new(sample_job(2, Algorithm::Sha256d)));
            jobs.insert(3, Arc::new(sample_job(3, Algorithm::Scrypt)));
        }
        let best = cache.best_job(Algorithm::Sha256d).unwrap();
        assert!(best.job_id == 1 || best.job_id == 2);
        assert_eq!(cache.best_job(Algorithm::Blake3).map(|j| j.job_id), None);
        assert!(cache.get(3).is_some());
        assert!(cache.get(99).is_none());
    }
}
