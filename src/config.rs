use std::collections::HashMap;

use serde::Deserialize;

use crate::algorithm::Algorithm;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayoutMethod {
    /// Aggregate unpaid shares and settle them with periodic `sendmany`
    /// transactions.
    Transaction,
    /// Split the block reward inside the coinbase itself, following the
    /// latest distribution snapshot.
    Coinbase,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StratumConfig {
    pub port: u16,
    pub algorithm: Algorithm,
    pub difficulty: f64,
    #[serde(default = "default_true")]
    pub variable_diff: bool,
    /// Desired seconds between accepted shares for this listener.
    #[serde(default = "default_submit_span")]
    pub submit_span: f64,
}

fn default_true() -> bool {
    true
}

fn default_submit_span() -> f64 {
    30.0
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    /// Node REST base URL; also the JSON-RPC endpoint and websocket origin.
    pub rest_api: String,
    /// Public host name handed to miners in `client.reconnect`.
    pub host_name: String,
    pub payout_method: PayoutMethod,
    /// Per-algorithm share normalization coefficients.
    pub coefficients: HashMap<Algorithm, f64>,
    pub bech32_hrp: String,
    pub share_retention_secs: u64,
    pub owner_fee: f64,
    /// Minimum total amount worth a `sendmany`, in the smallest unit.
    pub min_amount: u64,
    /// Per-account amounts at or below this are carried over, not sent.
    pub ignore_amount: u64,
    pub min_confirm: u64,
    pub payout_check_span_secs: u64,
    /// Refresh cadence for jobs and the distribution recorder.
    pub job_span_secs: u64,
    pub distribution_window_secs: u64,
    /// Fee charged per extra coinbase output in coinbase payout mode.
    pub extra_output_fee: u64,
    pub stratums: Vec<StratumConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "pool.db".to_string(),
            rest_api: "http://127.0.0.1:3000".to_string(),
            host_name: "127.0.0.1".to_string(),
            payout_method: PayoutMethod::Transaction,
            coefficients: HashMap::from([
                (Algorithm::Sha256d, 1.0),
                (Algorithm::Scrypt, 1.0),
                (Algorithm::Blake3, 1.0),
            ]),
            bech32_hrp: "tb".to_string(),
            share_retention_secs: 60 * 24 * 60 * 60,
            owner_fee: 0.05,
            min_amount: 5_000_000_000,
            ignore_amount: 10_000,
            min_confirm: 12,
            payout_check_span_secs: 3600,
            job_span_secs: 60,
            distribution_window_secs: 10_800,
            extra_output_fee: 10_000,
            stratums: vec![StratumConfig {
                port: 3333,
                algorithm: Algorithm::Sha256d,
                difficulty: 4.0,
                variable_diff: true,
                submit_span: 30.0,
            }],
        }
    }
}

impl Config {
    /// Defaults, overlaid by the JSON config file (path from `POOL_CONFIG`,
    /// default `pool_config.json`), overlaid by env vars for the knobs an
    /// operator flips without editing the file.
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("POOL_CONFIG").unwrap_or_else(|_| "pool_config.json".to_string());
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Config>(&text)
                .map_err(|e| anyhow::anyhow!("bad config file {path}: {e}"))?,
            Err(_) => Config::default(),
        };

        if let Ok(v) = std::env::var("POOL_DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = std::env::var("POOL_REST_API") {
            cfg.rest_api = v;
        }
        if let Ok(v) = std::env::var("POOL_HOST_NAME") {
            cfg.host_name = v;
        }
        if let Ok(v) = std::env::var("POOL_PAYOUT_METHOD") {
            cfg.payout_method = match v.to_ascii_lowercase().as_str() {
                "transaction" => PayoutMethod::Transaction,
                "coinbase" => PayoutMethod::Coinbase,
                other => anyhow::bail!("unknown payout method '{other}'"),
            };
        }
        if let Ok(v) = std::env::var("POOL_OWNER_FEE") {
            cfg.owner_fee = v.parse()?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.owner_fee) || self.owner_fee <= 0.0 {
            anyhow::bail!("owner_fee must be inside (0, 1), got {}", self.owner_fee);
        }
        if self.stratums.is_empty() {
            anyhow::bail!("no stratum listeners configured");
        }
        let mut seen_ports = std::collections::HashSet::new();
        for stratum in &self.stratums {
            if !seen_ports.insert(stratum.port) {
                anyhow::bail!("duplicate stratum port {}", stratum.port);
            }
            if self.coefficient(stratum.algorithm).is_none() {
                anyhow::bail!(
                    "no coefficient configured for algorithm {}",
                    stratum.algorithm
                );
            }
            if stratum.difficulty <= 0.0 {
                anyhow::bail!("initial difficulty must be positive on port {}", stratum.port);
            }
        }
        Ok(())
    }

    pub fn coefficient(&self, algorithm: Algorithm) -> Option<f64> {
        self.coefficients.get(&algorithm).copied()
    }

    /// Algorithms served by the configured listeners, deduplicated.
    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut out = Vec::new();
        for stratum in &self.stratums {
            if !out.contains(&stratum.algorithm) {
                out.push(stratum.algorithm);
            }
        }
        out
    }
}
