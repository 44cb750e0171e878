//! SQLite-backed durable record of deposits, withdrawals, and the summary
//! row, with every statement funneled through a dedicated [`TaskQueue`] so
//! SQL execution stays single-threaded regardless of how many callers hit
//! the store concurrently.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ark_bn254::Fr;
use rusqlite::{params, Connection};
use tracing::{error, warn};

use mixer_queue::{Job, TaskQueue};
use mixer_types::{DepositEvent, WithdrawalEvent};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS EventDeposit (
    timestamp INTEGER,
    blk_num INTEGER,
    tx_hash TEXT,
    commitment TEXT,
    leaf_index INTEGER
);
CREATE TABLE IF NOT EXISTS EventWithdraw (
    blk_num INTEGER,
    tx_hash TEXT,
    nullifier_hash TEXT,
    to_addr TEXT,
    fee TEXT
);
CREATE TABLE IF NOT EXISTS Info (
    latest_blk_num INTEGER,
    latest_leaf_index INTEGER,
    unspent INTEGER
);
-- latest_leaf_index seeds to -1, not 0: 0 is leaf_index of a real first
-- deposit, so the seed must be distinguishable from it for get_latest_leaf()
-- / rehydrate() to tell "no deposit yet" apart from "one deposit at index 0".
INSERT INTO Info (latest_blk_num, latest_leaf_index, unspent)
    SELECT 0, -1, 0 WHERE NOT EXISTS (SELECT * FROM Info);
"#;

/// Durable store for deposit/withdrawal events and the running summary row.
///
/// `opened` and request submission are guarded by one mutex so `open`/`close`
/// never race a concurrent query or insert; the SQL itself runs on the
/// store's own `TaskQueue` worker thread.
pub struct Store {
    tag: String,
    opened: Mutex<bool>,
    taskq: TaskQueue,
    conn: Arc<Mutex<Option<Connection>>>,
    busy_timeout_ms: u64,
}

impl Store {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            busy_timeout_ms: 5_000,
            opened: Mutex::new(false),
            taskq: TaskQueue::new("store"),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the `PRAGMA busy_timeout` applied on the next [`Store::open`].
    /// Has no effect on an already-open store.
    pub fn with_busy_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Open (creating if necessary) the database at `path`. Idempotent.
    pub fn open(&self, path: &Path) -> bool {
        let mut opened = self.opened.lock().unwrap();
        if *opened {
            warn!(target: "mixer_store", tag = %self.tag, "open() already opened");
            return true;
        }

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    error!(target: "mixer_store", tag = %self.tag, error = %e, "failed to create database directory");
                    return false;
                }
            }
        }

        self.taskq.start();

        let conn_slot = self.conn.clone();
        let tag = self.tag.clone();
        let path = path.to_path_buf();
        let busy_timeout_ms = self.busy_timeout_ms;
        let result = Arc::new(Mutex::new(false));
        let result_slot = result.clone();
        self.taskq.run_sync(Job::new("open", move || {
            match Connection::open(&path) {
                Ok(conn) => {
                    let pragmas = format!(
                        "PRAGMA cache_size=20971520; PRAGMA synchronous=OFF; PRAGMA journal_mode=WAL; PRAGMA temp_store=MEMORY; PRAGMA busy_timeout={busy_timeout_ms};"
                    );
                    let schema = conn
                        .execute_batch(&pragmas)
                        .and_then(|_| conn.execute_batch(SCHEMA));
                    match schema {
                        Ok(()) => {
                            *conn_slot.lock().unwrap() = Some(conn);
                            *result_slot.lock().unwrap() = true;
                        }
                        Err(e) => {
                            error!(target: "mixer_store", tag = %tag, error = %e, "schema init failed");
                        }
                    }
                }
                Err(e) => {
                    error!(target: "mixer_store", tag = %tag, error = %e, "open database exception");
                }
            }
        }));

        *opened = *result.lock().unwrap();
        *opened
    }

    /// Drain the queue and close the underlying connection.
    pub fn close(&self) {
        let mut opened = self.opened.lock().unwrap();
        if !*opened {
            warn!(target: "mixer_store", tag = %self.tag, "close() already closed");
            return;
        }

        let conn_slot = self.conn.clone();
        self.taskq.run_sync(Job::new("close", move || {
            conn_slot.lock().unwrap().take();
        }));
        self.taskq.stop();

        *opened = false;
    }

    pub fn get_latest_block(&self) -> Option<u64> {
        self.query_one("SELECT latest_blk_num FROM Info;", |row| row.get::<_, i64>(0))
            .map(|v| v as u64)
    }

    /// `None` when no deposit has ever been recorded.
    pub fn get_latest_leaf(&self) -> Option<u64> {
        let raw = self.query_one("SELECT latest_leaf_index FROM Info;", |row| row.get::<_, i64>(0))?;
        if raw < 0 {
            None
        } else {
            Some(raw as u64)
        }
    }

    pub fn get_unspent(&self) -> Option<i64> {
        self.query_one("SELECT unspent FROM Info;", |row| row.get::<_, i64>(0))
    }

    /// Inclusive `leaf_index` range, ordered ascending. Values that fail the
    /// `< p` canonical check are logged and skipped rather than returned.
    pub fn get_leaves(&self, start: u64, end: u64) -> Option<Vec<Fr>> {
        if !*self.opened.lock().unwrap() {
            error!(target: "mixer_store", tag = %self.tag, "get_leaves(): store not opened");
            return None;
        }

        let conn_slot = self.conn.clone();
        let tag = self.tag.clone();
        let result = Arc::new(Mutex::new(None));
        let result_slot = result.clone();
        self.taskq.run_sync(Job::new("get_leaves", move || {
            let guard = conn_slot.lock().unwrap();
            let conn = guard.as_ref().expect("connection present while opened");
            let query =
                "SELECT commitment FROM EventDeposit WHERE leaf_index BETWEEN ?1 AND ?2 ORDER BY leaf_index ASC;";
            let run = || -> rusqlite::Result<Vec<String>> {
                let mut stmt = conn.prepare(query)?;
                let rows = stmt.query_map(params![start as i64, end as i64], |row| row.get::<_, String>(0))?;
                rows.collect()
            };
            match run() {
                Ok(hexes) => *result_slot.lock().unwrap() = Some(hexes),
                Err(e) => error!(target: "mixer_store", tag = %tag, error = %e, "get_leaves query failed"),
            }
        }));

        let hexes = result.lock().unwrap().take()?;
        let mut leaves = Vec::with_capacity(hexes.len());
        for hex in hexes {
            match mixer_types::hex_to_field_checked(&hex) {
                Ok(f) => leaves.push(f),
                Err(e) => warn!(target: "mixer_store", tag = %self.tag, value = %hex, error = %e, "skipping out-of-range leaf"),
            }
        }
        Some(leaves)
    }

    /// Unconditionally set `Info.latest_blk_num`.
    pub fn set_latest_block(&self, n: u64) -> bool {
        self.with_transaction(move |tx| {
            tx.execute("UPDATE Info SET latest_blk_num = ?1;", params![n as i64])?;
            Ok(())
        })
    }

    /// Insert a deposit and update the summary row atomically.
    pub fn add_deposit(&self, d: &DepositEvent) -> bool {
        let d = d.clone();
        self.with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO EventDeposit (timestamp, blk_num, tx_hash, commitment, leaf_index) VALUES (?1, ?2, ?3, ?4, ?5);",
                params![d.timestamp as i64, d.block_number as i64, d.tx_hash, d.commitment, d.leaf_index],
            )?;
            tx.execute("UPDATE Info SET unspent = unspent + 1;", [])?;
            tx.execute(
                "UPDATE Info SET latest_leaf_index = ?1 WHERE latest_leaf_index < ?1;",
                params![d.leaf_index],
            )?;
            tx.execute(
                "UPDATE Info SET latest_blk_num = ?1 WHERE latest_blk_num < ?1;",
                params![d.block_number as i64],
            )?;
            Ok(())
        })
    }

    /// Insert a withdrawal and update the summary row atomically.
    pub fn add_withdraw(&self, w: &WithdrawalEvent) -> bool {
        let w = w.clone();
        self.with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO EventWithdraw (blk_num, tx_hash, nullifier_hash, to_addr, fee) VALUES (?1, ?2, ?3, ?4, ?5);",
                params![w.block_number as i64, w.tx_hash, w.nullifier_hash, w.to, w.fee.to_string()],
            )?;
            tx.execute("UPDATE Info SET unspent = unspent - 1;", [])?;
            Ok(())
        })
    }

    fn query_one<T, F>(&self, sql: &'static str, extract: F) -> Option<T>
    where
        T: Send + 'static,
        F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        if !*self.opened.lock().unwrap() {
            error!(target: "mixer_store", tag = %self.tag, "query on unopened store");
            return None;
        }

        let conn_slot = self.conn.clone();
        let tag = self.tag.clone();
        let result = Arc::new(Mutex::new(None));
        let result_slot = result.clone();
        self.taskq.run_sync(Job::new("query", move || {
            let guard = conn_slot.lock().unwrap();
            let conn = guard.as_ref().expect("connection present while opened");
            match conn.query_row(sql, [], &extract) {
                Ok(v) => *result_slot.lock().unwrap() = Some(v),
                Err(e) => error!(target: "mixer_store", tag = %tag, sql = %sql, error = %e, "query exception"),
            }
        }));

        result.lock().unwrap().take()
    }

    /// Run `body` inside a SQLite transaction on the store's worker thread.
    /// Commits on `Ok`, rolls back (implicitly, on drop) on `Err`.
    fn with_transaction<F>(&self, body: F) -> bool
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<()> + Send + 'static,
    {
        if !*self.opened.lock().unwrap() {
            error!(target: "mixer_store", tag = %self.tag, "write on unopened store");
            return false;
        }

        let conn_slot = self.conn.clone();
        let tag = self.tag.clone();
        let succeeded = Arc::new(Mutex::new(false));
        let succeeded_slot = succeeded.clone();
        self.taskq.run_sync(Job::new("write", move || {
            let mut guard = conn_slot.lock().unwrap();
            let conn = guard.as_mut().expect("connection present while opened");
            let run = || -> rusqlite::Result<()> {
                let tx = conn.transaction()?;
                body(&tx)?;
                tx.commit()
            };
            match run() {
                Ok(()) => *succeeded_slot.lock().unwrap() = true,
                Err(e) => error!(target: "mixer_store", tag = %tag, error = %e, "write failed, rolling back"),
            }
        }));

        *succeeded.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("nested").join("mixer.sqlite")
    }

    #[test]
    fn open_creates_directories_and_seed_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new("test");
        assert!(store.open(&scratch_path(&dir)));

        assert_eq!(store.get_latest_block(), Some(0));
        assert_eq!(store.get_latest_leaf(), None);
        assert_eq!(store.get_unspent(), Some(0));

        store.close();
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new("test");
        assert!(store.open(&scratch_path(&dir)));
        assert!(store.open(&scratch_path(&dir)));
        store.close();
    }

    #[test]
    fn s4_deposit_then_withdraw_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new("test");
        assert!(store.open(&scratch_path(&dir)));

        let deposit = DepositEvent::new(1000, 100, "0xaa", "0x01", 0);
        assert!(store.add_deposit(&deposit));

        let withdraw = WithdrawalEvent::new(101, "0xbb", "0xcc", "0xdd", 5);
        assert!(store.add_withdraw(&withdraw));

        assert_eq!(store.get_latest_block(), Some(101));
        assert_eq!(store.get_latest_leaf(), Some(0));
        assert_eq!(store.get_unspent(), Some(0));

        store.close();
    }

    #[test]
    fn get_leaves_returns_inclusive_range_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new("test");
        assert!(store.open(&scratch_path(&dir)));

        for i in 0..5u32 {
            let commitment = format!("0x{:064x}", i + 1);
            let d = DepositEvent::new(1000 + i as u64, 100, &format!("0x{i:02x}"), &commitment, i);
            assert!(store.add_deposit(&d));
        }

        let leaves = store.get_leaves(1, 3).unwrap();
        assert_eq!(leaves, vec![Fr::from(2u64), Fr::from(3u64), Fr::from(4u64)]);

        store.close();
    }

    #[test]
    fn queries_on_unopened_store_return_none() {
        let store = Store::new("test");
        assert_eq!(store.get_latest_block(), None);
        assert_eq!(store.get_unspent(), None);
        assert_eq!(store.get_leaves(0, 10), None);
    }

    #[test]
    fn failed_write_rolls_back_and_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new("test");
        assert!(store.open(&scratch_path(&dir)));

        // First statement succeeds, second references a nonexistent table —
        // the whole transaction must roll back, including the first statement.
        let ok = store.with_transaction(|tx| {
            tx.execute("UPDATE Info SET unspent = unspent + 1;", [])?;
            tx.execute("INSERT INTO NoSuchTable VALUES (1);", [])?;
            Ok(())
        });
        assert!(!ok);
        assert_eq!(store.get_unspent(), Some(0));

        store.close();
    }
}
