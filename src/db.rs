/// SQLite persistence store
///
/// Four tables: account, subscription, share, payout transaction. The store
/// is single-writer; every top-level operation opens its own connection with
/// a 120 s busy timeout, WAL journaling and NORMAL synchronous mode, and runs
/// inside one transaction. Range scans that feed payouts use EXCLUSIVE
/// transactions because IMMEDIATE still allows phantom reads on them.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::algorithm::Algorithm;

/// 26-byte prefix put in front of the 6-byte random row key to form the
/// 32-byte subscription id handed to miners.
const SUBSCRIPTION_ID_PREFIX: [u8; 26] = [
    0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store worker terminated")]
    Worker,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the on-disk store. Cheap to clone; connections are opened per
/// top-level operation.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(120))?;
        // journal_mode returns a row, so it goes through query_row
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        Ok(conn)
    }

    /// Run a store operation on the blocking pool. rusqlite is synchronous;
    /// this keeps its file I/O off the async workers.
    pub async fn run<F, T>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.open()?;
            op(&mut conn)
        })
        .await
        .map_err(|_| StoreError::Worker)?
    }

    pub fn init_schema(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS `account` (
                 `id` INTEGER PRIMARY KEY,
                 `address` TEXT NOT NULL,
                 `time` INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS `subscription` (
                 `id` INTEGER PRIMARY KEY,
                 `extranonce` BLOB NOT NULL,
                 `time` INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS `share` (
                 `time` REAL PRIMARY KEY,
                 `account_id` INTEGER NOT NULL,
                 `algorithm` INTEGER NOT NULL,
                 `blockhash` BLOB,
                 `share` REAL NOT NULL,
                 `payout_id` INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS `payout` (
                 `id` INTEGER PRIMARY KEY,
                 `txhash` BLOB NOT NULL,
                 `amount` INTEGER NOT NULL,
                 `begin` INTEGER NOT NULL,
                 `end` INTEGER NOT NULL,
                 `time` INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS `address_index` ON `account` (`address`);
             CREATE INDEX IF NOT EXISTS `txhash_index` ON `payout` (`txhash`);
             CREATE INDEX IF NOT EXISTS `time_index` ON `payout` (`time`);",
        )?;
        Ok(())
    }

    /// Drop subscriptions and shares older than the retention window.
    pub fn cleanup(&self, retention_secs: u64) -> StoreResult<(usize, usize)> {
        let mut conn = self.open()?;
        let limit = epoch_now() as i64 - retention_secs as i64;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let subs = tx.execute("DELETE FROM `subscription` WHERE `time` < ?1", params![limit])?;
        let shares = tx.execute("DELETE FROM `share` WHERE `time` < ?1", params![limit])?;
        tx.commit()?;
        Ok((subs, shares))
    }
}

pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

// account

/// Resolve an address to its account id, creating the row on first sight
/// when `create_if_missing` is set.
pub fn address_to_account_id(
    conn: &Connection,
    address: &str,
    create_if_missing: bool,
) -> StoreResult<i64> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT `id` FROM `account` WHERE `address` = ?1",
            params![address],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(id) => Ok(id),
        None if create_if_missing => insert_new_account(conn, address),
        None => Err(StoreError::NotFound(format!("no account for {address}"))),
    }
}

pub fn account_id_to_address(conn: &Connection, account_id: i64) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT `address` FROM `account` WHERE `id` = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn insert_new_account(conn: &Connection, address: &str) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO `account` (`address`, `time`) VALUES (?1, ?2)",
        params![address, epoch_now() as i64],
    )?;
    Ok(conn.last_insert_rowid())
}

// subscription

/// The row key is the low-order 6 bytes of the 32-byte id.
pub fn subscription_id_to_extranonce(
    conn: &Connection,
    subscription_id: &[u8; 32],
) -> StoreResult<Option<[u8; 4]>> {
    let row_key = row_key_of(subscription_id);
    let found: Option<Vec<u8>> = conn
        .query_row(
            "SELECT `extranonce` FROM `subscription` WHERE `id` = ?1",
            params![row_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.and_then(|bytes| bytes.as_slice().try_into().ok()))
}

pub fn insert_new_subscription(
    conn: &Connection,
    extranonce: &[u8; 4],
) -> StoreResult<[u8; 32]> {
    let mut top_id = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut top_id);
    let row_key = i64::from_be_bytes([0, 0, top_id[0], top_id[1], top_id[2], top_id[3], top_id[4], top_id[5]]);
    conn.execute(
        "INSERT INTO `subscription` (`id`, `extranonce`, `time`) VALUES (?1, ?2, ?3)",
        params![row_key, extranonce.as_slice(), epoch_now() as i64],
    )?;
    let mut id = [0u8; 32];
    id[..26].copy_from_slice(&SUBSCRIPTION_ID_PREFIX);
    id[26..].copy_from_slice(&top_id);
    Ok(id)
}

fn row_key_of(subscription_id: &[u8; 32]) -> i64 {
    let tail = &subscription_id[26..32];
    i64::from_be_bytes([0, 0, tail[0], tail[1], tail[2], tail[3], tail[4], tail[5]])
}

// share

/// Total unpaid work in `[begin, end)`. Empty result is reported as zero.
pub fn total_unpaid_shares(conn: &Connection, begin: f64, end: f64) -> StoreResult<f64> {
    let sum: Option<f64> = conn.query_row(
        "SELECT SUM(`share`) FROM `share`
         WHERE ?1 <= `time` AND `time` < ?2 AND `payout_id` < 1",
        params![begin, end],
        |row| row.get(0),
    )?;
    Ok(sum.unwrap_or(0.0))
}

pub fn account_unpaid_shares(
    conn: &Connection,
    begin: f64,
    end: f64,
    account_id: i64,
) -> StoreResult<f64> {
    let sum: Option<f64> = conn.query_row(
        "SELECT SUM(`share`) FROM `share`
         WHERE ?1 <= `time` AND `time` < ?2 AND `payout_id` < 1 AND `account_id` = ?3",
        params![begin, end, account_id],
        |row| row.get(0),
    )?;
    Ok(sum.unwrap_or(0.0))
}

/// Per-account work sums for one algorithm, the distribution snapshot input.
pub fn distribution_shares(
    conn: &Connection,
    begin: f64,
    end: f64,
    algorithm: Algorithm,
) -> StoreResult<Vec<(i64, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT `account_id`, SUM(`share`) FROM `share`
         WHERE ?1 <= `time` AND `time` < ?2 AND `algorithm` = ?3
         GROUP BY `account_id`",
    )?;
    let rows = stmt.query_map(params![begin, end, algorithm.id()], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn related_accounts(conn: &Connection, begin: f64, end: f64) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT `account_id` FROM `share` WHERE ?1 <= `time` AND `time` < ?2",
    )?;
    let rows = stmt.query_map(params![begin, end], |row| row.get::<_, i64>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn related_blockhash(
    conn: &Connection,
    begin: f64,
    end: f64,
) -> StoreResult<Vec<Option<Vec<u8>>>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT `blockhash` FROM `share` WHERE ?1 <= `time` AND `time` < ?2",
    )?;
    let rows = stmt.query_map(params![begin, end], |row| row.get::<_, Option<Vec<u8>>>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Oldest contiguous unpaid share time, scanning from the newest row down to
/// the first already-paid one. Errors if the share table is empty.
pub fn last_unpaid_time(conn: &Connection) -> StoreResult<f64> {
    let mut stmt =
        conn.prepare("SELECT `time`, `payout_id` FROM `share` ORDER BY `time` DESC")?;
    let mut rows = stmt.query([])?;
    let mut before_time: Option<f64> = None;
    while let Some(row) = rows.next()? {
        let time: f64 = row.get(0)?;
        let payout_id: i64 = row.get(1)?;
        if payout_id != 0 {
            return before_time.ok_or_else(|| StoreError::NotFound("no unpaid share".into()));
        }
        before_time = Some(time);
    }
    before_time.ok_or_else(|| StoreError::NotFound("no share recorded".into()))
}

/// Mined (blockhash-bearing) shares newest first, stopping at the first paid
/// row - the payout candidate set.
pub fn latest_mined_shares(conn: &Connection) -> StoreResult<Vec<(f64, [u8; 32])>> {
    let mut stmt = conn
        .prepare("SELECT `time`, `blockhash`, `payout_id` FROM `share` ORDER BY `time` DESC")?;
    let mut rows = stmt.query([])?;
    let mut mined = Vec::new();
    while let Some(row) = rows.next()? {
        let payout_id: i64 = row.get(2)?;
        if payout_id != 0 {
            break;
        }
        if let Some(hash) = row.get::<_, Option<Vec<u8>>>(1)? {
            if let Ok(hash) = <[u8; 32]>::try_from(hash.as_slice()) {
                mined.push((row.get::<_, f64>(0)?, hash));
            }
        }
    }
    Ok(mined)
}

pub fn insert_new_share(
    conn: &Connection,
    account_id: i64,
    algorithm: Algorithm,
    blockhash: Option<[u8; 32]>,
    share: f64,
    payout_id: i64,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO `share`
         (`time`, `account_id`, `algorithm`, `blockhash`, `share`, `payout_id`)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            epoch_now(),
            account_id,
            algorithm.id(),
            blockhash.as_ref().map(|h| h.as_slice()),
            share,
            payout_id
        ],
    )?;
    Ok(())
}

/// Mark the listed accounts' unpaid shares in `[begin, end)` as settled by
/// `payout_id`. Returns the number of rows touched.
pub fn update_shares_as_paid(
    conn: &Connection,
    payout_id: i64,
    begin: f64,
    end: f64,
    accounts: &[i64],
) -> StoreResult<usize> {
    if accounts.is_empty() {
        return Ok(0);
    }
    let id_list = accounts
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE `share` SET `payout_id` = ?1
         WHERE ?2 <= `time` AND `time` < ?3 AND `payout_id` = 0 AND `account_id` IN ({id_list})"
    );
    Ok(conn.execute(&sql, params![payout_id, begin, end])?)
}

/// Inverse of `update_shares_as_paid` for a failed payout.
pub fn revert_paid_shares(
    conn: &Connection,
    begin: f64,
    end: f64,
    payout_id: i64,
) -> StoreResult<usize> {
    Ok(conn.execute(
        "UPDATE `share` SET `payout_id` = 0
         WHERE ?1 <= `time` AND `time` < ?2 AND `payout_id` = ?3",
        params![begin, end, payout_id],
    )?)
}

// payout transactions

pub fn payout_to_txhash(conn: &Connection, payout_id: i64) -> StoreResult<Vec<u8>> {
    conn.query_row(
        "SELECT `txhash` FROM `payout` WHERE `id` = ?1",
        params![payout_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("no payout id={payout_id}")))
}

pub fn txhash_to_payout(conn: &Connection, txhash: &[u8]) -> StoreResult<i64> {
    conn.query_row(
        "SELECT `id` FROM `payout` WHERE `txhash` = ?1",
        params![txhash],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("no payout tx {}", hex::encode(txhash))))
}

pub fn last_paid_txhash(conn: &Connection) -> StoreResult<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT `txhash` FROM `payout` ORDER BY `id` DESC",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn list_payouts(
    conn: &Connection,
) -> StoreResult<Vec<(i64, Vec<u8>, i64, i64, i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT `id`, `txhash`, `amount`, `begin`, `end`, `time`
         FROM `payout` ORDER BY `id` DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert_new_payout(
    conn: &Connection,
    txhash: &[u8],
    amount: i64,
    begin: f64,
    end: f64,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO `payout` (`txhash`, `amount`, `begin`, `end`, `time`)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![txhash, amount, begin as i64, end as i64, epoch_now() as i64],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("pool.db"));
        store.init_schema().unwrap();
        (dir, store)
    }

    fn insert_share_at(
        conn: &Connection,
        time: f64,
        account_id: i64,
        share: f64,
        blockhash: Option<[u8; 32]>,
        payout_id: i64,
    ) {
        conn.execute(
            "INSERT INTO `share`
             (`time`, `account_id`, `algorithm`, `blockhash`, `share`, `payout_id`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                time,
                account_id,
                Algorithm::Sha256d.id(),
                blockhash.as_ref().map(|h| h.as_slice()),
                share,
                payout_id
            ],
        )
        .unwrap();
    }

    #[test]
    fn account_lookup_and_creation() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        assert!(matches!(
            address_to_account_id(&conn, "tb1qexample", false),
            Err(StoreError::NotFound(_))
        ));
        let id = address_to_account_id(&conn, "tb1qexample", true).unwrap();
        assert_eq!(address_to_account_id(&conn, "tb1qexample", false).unwrap(), id);
        assert_eq!(
            account_id_to_address(&conn, id).unwrap().as_deref(),
            Some("tb1qexample")
        );
        assert_eq!(account_id_to_address(&conn, id + 1).unwrap(), None);
    }

    #[test]
    fn subscription_id_round_trip() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        let extranonce = [0x11, 0x22, 0x33, 0x44];
        let id = insert_new_subscription(&conn, &extranonce).unwrap();
        assert_eq!(&id[..26], &SUBSCRIPTION_ID_PREFIX);
        assert_eq!(
            subscription_id_to_extranonce(&conn, &id).unwrap(),
            Some(extranonce)
        );
        // extranonce stays constant on repeated lookups
        assert_eq!(
            subscription_id_to_extranonce(&conn, &id).unwrap(),
            Some(extranonce)
        );
        let unknown = [0u8; 32];
        assert_eq!(subscription_id_to_extranonce(&conn, &unknown).unwrap(), None);
    }

    #[test]
    fn unpaid_sum_decreases_by_marked_amount() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        insert_share_at(&conn, 100.0, 1, 0.5, None, 0);
        insert_share_at(&conn, 101.0, 1, 0.25, None, 0);
        insert_share_at(&conn, 102.0, 2, 1.0, None, 0);
        assert_eq!(total_unpaid_shares(&conn, 0.0, 200.0).unwrap(), 1.75);

        let marked = update_shares_as_paid(&conn, 7, 0.0, 200.0, &[1]).unwrap();
        assert_eq!(marked, 2);
        assert_eq!(total_unpaid_shares(&conn, 0.0, 200.0).unwrap(), 1.0);
        assert_eq!(account_unpaid_shares(&conn, 0.0, 200.0, 1).unwrap(), 0.0);
    }

    #[test]
    fn revert_restores_exactly_the_marked_rows() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        insert_share_at(&conn, 10.0, 1, 0.1, None, 0);
        insert_share_at(&conn, 11.0, 2, 0.2, None, 0);
        insert_share_at(&conn, 12.0, 1, 0.3, None, 5); // settled by another payout

        let marked = update_shares_as_paid(&conn, 9, 0.0, 20.0, &[1, 2]).unwrap();
        assert_eq!(marked, 2);
        let reverted = revert_paid_shares(&conn, 0.0, 20.0, 9).unwrap();
        assert_eq!(reverted, marked);
        assert_eq!(total_unpaid_shares(&conn, 0.0, 20.0).unwrap(), 0.1 + 0.2);
    }

    #[test]
    fn last_unpaid_time_stops_at_first_paid_row() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        assert!(matches!(
            last_unpaid_time(&conn),
            Err(StoreError::NotFound(_))
        ));
        insert_share_at(&conn, 50.0, 1, 0.1, None, 3);
        insert_share_at(&conn, 60.0, 1, 0.1, None, 0);
        insert_share_at(&conn, 70.0, 1, 0.1, None, 0);
        assert_eq!(last_unpaid_time(&conn).unwrap(), 60.0);
    }

    #[test]
    fn mined_share_iteration_stops_at_paid() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        insert_share_at(&conn, 10.0, 1, 0.1, Some([1u8; 32]), 2); // paid, below the cut
        insert_share_at(&conn, 20.0, 1, 0.1, None, 0);
        insert_share_at(&conn, 30.0, 1, 0.1, Some([2u8; 32]), 0);
        insert_share_at(&conn, 40.0, 1, 0.1, Some([3u8; 32]), 0);

        let mined = latest_mined_shares(&conn).unwrap();
        assert_eq!(mined, vec![(40.0, [3u8; 32]), (30.0, [2u8; 32])]);

        let hashes = related_blockhash(&conn, 0.0, 50.0).unwrap();
        assert_eq!(hashes.len(), 4); // three distinct hashes plus NULL
        assert!(hashes.iter().any(|h| h.is_none()));
    }

    #[test]
    fn distribution_groups_by_account_and_algorithm() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        insert_share_at(&conn, 1.0, 1, 0.5, None, 0);
        insert_share_at(&conn, 2.0, 1, 0.5, None, 0);
        insert_share_at(&conn, 3.0, 2, 2.0, None, 0);
        conn.execute(
            "INSERT INTO `share`
             (`time`, `account_id`, `algorithm`, `blockhash`, `share`, `payout_id`)
             VALUES (4.0, 3, ?1, NULL, 9.0, 0)",
            params![Algorithm::Blake3.id()],
        )
        .unwrap();

        let mut dist = distribution_shares(&conn, 0.0, 10.0, Algorithm::Sha256d).unwrap();
        dist.sort_by_key(|(account_id, _)| *account_id);
        assert_eq!(dist, vec![(1, 1.0), (2, 2.0)]);
        let mut accounts = related_accounts(&conn, 0.0, 10.0).unwrap();
        accounts.sort();
        assert_eq!(accounts, vec![1, 2, 3]);
    }

    #[test]
    fn payout_row_lookup_by_id_and_txhash() {
        let (_dir, store) = fresh_store();
        let conn = store.open().unwrap();

        let txhash = [0xab; 32];
        let id = insert_new_payout(&conn, &txhash, 100_000_000, 10.0, 20.0).unwrap();
        assert_eq!(payout_to_txhash(&conn, id).unwrap(), txhash.to_vec());
        assert_eq!(txhash_to_payout(&conn, &txhash).unwrap(), id);
        assert_eq!(last_paid_txhash(&conn).unwrap(), Some(txhash.to_vec()));
        let payouts = list_payouts(&conn).unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].2, 100_000_000);
    }

    #[test]
    fn cleanup_drops_expired_rows() {
        let (_dir, store) = fresh_store();
        {
            let conn = store.open().unwrap();
            let old = epoch_now() - 100_000.0;
            insert_share_at(&conn, old, 1, 0.1, None, 0);
            insert_share_at(&conn, epoch_now(), 1, 0.1, None, 0);
            conn.execute(
                "INSERT INTO `subscription` (`id`, `extranonce`, `time`) VALUES (1, x'00112233', ?1)",
                params![old as i64],
            )
            .unwrap();
        }
        let (subs, shares) = store.cleanup(50_000).unwrap();
        assert_eq!(subs, 1);
        assert_eq!(shares, 1);
    }
}
