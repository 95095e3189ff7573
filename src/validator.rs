/// Share validation
///
/// Rebuilds the candidate block a miner claims to have worked on, computes
/// the work hash and classifies the submission against both the network
/// target (mined) and the session's share target (shared). Pure with respect
/// to pool state; the caller handles duplicates, counters and persistence.

use crate::chain::codec::{bits_to_target, target_from_difficulty, write_compact_size, Block};
use crate::chain::hashing::{merkle_root, sha256d};
use crate::jobs::Job;

pub struct Submission {
    /// `submitblock` payload, present only when the network target was met.
    pub payload: Option<Vec<u8>>,
    pub block: Block,
    pub mined: bool,
    pub shared: bool,
}

/// Check a `mining.submit` against its job. `nonce` arrives already
/// byte-reversed from the wire; `difficulty` is the session's normalized
/// (coefficient-adjusted) share difficulty.
pub fn check_submission(
    job: &Job,
    extranonce1: [u8; 4],
    extranonce2: [u8; 4],
    nonce: [u8; 4],
    difficulty: f64,
) -> Submission {
    let mut coinbase =
        Vec::with_capacity(job.coinbase1.len() + 8 + job.coinbase2.len());
    coinbase.extend_from_slice(&job.coinbase1);
    coinbase.extend_from_slice(&extranonce1);
    coinbase.extend_from_slice(&extranonce2);
    coinbase.extend_from_slice(&job.coinbase2);

    let coinbase_hash = sha256d(&coinbase);
    let mut leaves = Vec::with_capacity(1 + job.unconfirmed.len());
    leaves.push(coinbase_hash);
    leaves.extend(job.unconfirmed.iter().map(|(hash, _)| *hash));
    let merkleroot = merkle_root(&leaves);

    let block = Block::new(
        job.version,
        job.previous_hash,
        merkleroot,
        job.ntime,
        job.bits_u32(),
        nonce,
        job.height,
        job.algorithm,
    );

    let mined = block.pow_check(&bits_to_target(job.bits_u32()));
    let shared = block.pow_check(&target_from_difficulty(difficulty));
    tracing::debug!(
        height = block.height,
        work = %hex::encode(block.work_hash),
        mined,
        shared,
        "submission checked"
    );

    let payload = mined.then(|| {
        let mut data = Vec::with_capacity(80 + coinbase.len());
        data.extend_from_slice(&block.header());
        write_compact_size(job.unconfirmed.len() as u64 + 1, &mut data);
        data.extend_from_slice(&coinbase);
        for (_, raw) in &job.unconfirmed {
            data.extend_from_slice(raw);
        }
        data
    });

    Submission { payload, block, mined, shared }
}
