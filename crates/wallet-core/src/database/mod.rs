//! Persistence layer: a single SQLite connection behind managed and manual
//! transactions.
//!
//! All wallet state lives in the record tables defined in [`records`] and is
//! only ever touched through a [`Tx`]. Managed transactions ([`Database::view`]
//! and [`Database::update`]) commit or roll back on the closure's result; the
//! closures receive a handle that cannot commit or roll back itself, so
//! misuse is a compile error rather than a runtime panic. Manual transactions
//! ([`Database::begin`]) add [`Tx::commit`], [`Tx::rollback`], and
//! [`Tx::on_commit`] for operations that must couple local state changes with
//! a network broadcast.

pub mod records;

use std::mem;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use crate::error::WalletError;
use records::Record;

/// A deferred side effect that runs after a durable commit.
pub type CommitHook = Box<dyn FnOnce() -> Result<(), WalletError> + Send>;

/// Wallet database: one SQLite connection, serialized by a mutex.
///
/// Transactions must not be long running, and they must not nest: beginning
/// a second transaction while one is open on the same thread deadlocks on
/// the connection lock. Helpers that run inside an open transaction take the
/// transaction as an argument instead of opening their own.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the wallet database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database. State is lost on drop.
    pub fn open_in_memory() -> Result<Self, WalletError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Begins a manual read-write transaction.
    ///
    /// Dropping the returned [`Tx`] without committing rolls it back.
    pub fn begin(&self) -> Result<Tx<'_>, WalletError> {
        let guard = self.conn.lock();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Tx {
            guard,
            hooks: Vec::new(),
            open: true,
        })
    }

    /// Runs `f` inside a managed read-only transaction.
    pub fn view<R>(
        &self,
        f: impl FnOnce(&Tx<'_>) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let mut tx = self.begin()?;
        let result = f(&tx);
        tx.open = false;
        tx.guard.execute_batch("ROLLBACK")?;
        result
    }

    /// Runs `f` inside a managed read-write transaction. The transaction is
    /// committed when `f` returns `Ok` and rolled back on `Err`.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut Tx<'_>) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(r) => {
                tx.commit()?;
                Ok(r)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Closes the database. Outstanding transactions must have been
    /// finalized; this blocks until the connection lock is free.
    pub fn close(self) {
        drop(self.conn.into_inner());
    }
}

/// An open transaction. Reads take `&self`; writes take `&mut self`, so a
/// managed read-only transaction (which hands out `&Tx`) cannot write.
pub struct Tx<'db> {
    guard: MutexGuard<'db, Connection>,
    hooks: Vec<CommitHook>,
    open: bool,
}

impl<'db> Tx<'db> {
    /// Commits the transaction, then runs any registered commit hooks in
    /// registration order. A hook error is returned to the caller but the
    /// commit itself stands; remaining hooks are skipped.
    pub fn commit(mut self) -> Result<(), WalletError> {
        self.guard.execute_batch("COMMIT")?;
        self.open = false;
        let hooks = mem::take(&mut self.hooks);
        // Release the connection lock before hooks run: hooks open their own
        // transactions to apply local mutations.
        drop(self);
        for hook in hooks {
            if let Err(e) = hook() {
                warn!(error = %e, "commit hook failed after durable commit");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Rolls the transaction back, discarding writes and commit hooks.
    pub fn rollback(mut self) -> Result<(), WalletError> {
        self.open = false;
        self.guard.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Registers a side effect to run after a successful [`Tx::commit`].
    pub fn on_commit(
        &mut self,
        hook: impl FnOnce() -> Result<(), WalletError> + Send + 'static,
    ) {
        self.hooks.push(Box::new(hook));
    }

    /// Creates the table for `T` if it does not exist yet.
    pub fn migrate<T: Record>(&mut self) -> Result<(), WalletError> {
        debug!(table = T::TABLE, "migrating table");
        self.guard.execute_batch(T::CREATE)?;
        Ok(())
    }

    /// Saves (upserts) a record.
    pub fn save<T: Record>(&mut self, record: &T) -> Result<(), WalletError> {
        let placeholders: Vec<String> =
            (1..=T::COLUMNS.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            T::TABLE,
            T::COLUMNS.join(", "),
            placeholders.join(", ")
        );
        self.guard.execute(&sql, params_from_iter(record.bind()))?;
        Ok(())
    }

    /// Returns every record of type `T` matching all `field = value`
    /// predicates (all records when `clauses` is empty).
    pub fn find_where<T: Record>(
        &self,
        clauses: &[(&str, Value)],
    ) -> Result<Vec<T>, WalletError> {
        self.query(clauses, None)
    }

    /// Returns the first record matching the predicates in `order_by`
    /// order, or [`WalletError::NotFound`].
    pub fn find_first<T: Record>(
        &self,
        clauses: &[(&str, Value)],
        order_by: &str,
    ) -> Result<T, WalletError> {
        self.query(clauses, Some(order_by))?
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::NotFound(T::TABLE.to_string()))
    }

    /// Sets `set.0 = set.1` on every record matching the predicates.
    /// Returns the number of rows changed.
    pub fn update_where<T: Record>(
        &mut self,
        set: (&str, Value),
        clauses: &[(&str, Value)],
    ) -> Result<usize, WalletError> {
        let mut sql = format!("UPDATE {} SET {} = ?1", T::TABLE, set.0);
        if !clauses.is_empty() {
            let preds: Vec<String> = clauses
                .iter()
                .enumerate()
                .map(|(i, (field, _))| format!("{} = ?{}", field, i + 2))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&preds.join(" AND "));
        }
        let mut params = vec![set.1.clone()];
        params.extend(clauses.iter().map(|(_, v)| v.clone()));
        Ok(self.guard.execute(&sql, params_from_iter(params))?)
    }

    /// Deletes every record matching the predicates. Returns the number of
    /// rows deleted.
    pub fn delete_where<T: Record>(
        &mut self,
        clauses: &[(&str, Value)],
    ) -> Result<usize, WalletError> {
        let mut sql = format!("DELETE FROM {}", T::TABLE);
        if !clauses.is_empty() {
            let preds: Vec<String> = clauses
                .iter()
                .enumerate()
                .map(|(i, (field, _))| format!("{} = ?{}", field, i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&preds.join(" AND "));
        }
        let params: Vec<Value> = clauses.iter().map(|(_, v)| v.clone()).collect();
        Ok(self.guard.execute(&sql, params_from_iter(params))?)
    }

    fn query<T: Record>(
        &self,
        clauses: &[(&str, Value)],
        order_by: Option<&str>,
    ) -> Result<Vec<T>, WalletError> {
        let mut sql = format!("SELECT {} FROM {}", T::COLUMNS.join(", "), T::TABLE);
        if !clauses.is_empty() {
            let preds: Vec<String> = clauses
                .iter()
                .enumerate()
                .map(|(i, (field, _))| format!("{} = ?{}", field, i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&preds.join(" AND "));
        }
        if let Some(order) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        let params: Vec<Value> = clauses.iter().map(|(_, v)| v.clone()).collect();
        let mut stmt = self.guard.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), T::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.guard.execute_batch("ROLLBACK") {
                warn!(error = %e, "implicit rollback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::records::{AddressRecord, UtxoRecord};
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.update(|tx| {
            tx.migrate::<AddressRecord>()?;
            tx.migrate::<UtxoRecord>()
        })
        .unwrap();
        db
    }

    fn addr(address: &str, index: u32, used: bool) -> AddressRecord {
        AddressRecord {
            address: address.into(),
            key_index: index,
            is_change: false,
            used,
            coin: "BTC".into(),
        }
    }

    #[test]
    fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.db");

        let db = Database::open(&path).unwrap();
        db.update(|tx| {
            tx.migrate::<AddressRecord>()?;
            tx.save(&addr("a0", 0, true))
        })
        .unwrap();
        db.close();

        let reopened = Database::open(&path).unwrap();
        let found: Vec<AddressRecord> = reopened.view(|tx| tx.find_where(&[])).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "a0");
        assert!(found[0].used);
    }

    #[test]
    fn save_and_find() {
        let db = test_db();
        db.update(|tx| tx.save(&addr("a0", 0, false))).unwrap();

        let found: Vec<AddressRecord> = db
            .view(|tx| tx.find_where(&[("coin", "BTC".to_string().into())]))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "a0");
    }

    #[test]
    fn save_is_upsert() {
        let db = test_db();
        db.update(|tx| {
            tx.save(&addr("a0", 0, false))?;
            tx.save(&addr("a0", 0, true))
        })
        .unwrap();

        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].used);
    }

    #[test]
    fn find_first_orders_and_errors() {
        let db = test_db();
        db.update(|tx| {
            tx.save(&addr("a2", 2, false))?;
            tx.save(&addr("a0", 0, false))?;
            tx.save(&addr("a1", 1, false))
        })
        .unwrap();

        let first: AddressRecord = db
            .view(|tx| tx.find_first(&[("used", 0i64.into())], "key_index ASC"))
            .unwrap();
        assert_eq!(first.key_index, 0);

        let missing: Result<AddressRecord, _> =
            db.view(|tx| tx.find_first(&[("coin", "DOGE".to_string().into())], "key_index ASC"));
        assert!(matches!(missing, Err(WalletError::NotFound(_))));
    }

    #[test]
    fn update_where_changes_matching_rows() {
        let db = test_db();
        db.update(|tx| {
            tx.save(&addr("a0", 0, false))?;
            tx.save(&addr("a1", 1, false))
        })
        .unwrap();

        let changed = db
            .update(|tx| {
                tx.update_where::<AddressRecord>(
                    ("used", 1i64.into()),
                    &[("address", "a0".to_string().into())],
                )
            })
            .unwrap();
        assert_eq!(changed, 1);

        let used: Vec<AddressRecord> = db
            .view(|tx| tx.find_where(&[("used", 1i64.into())]))
            .unwrap();
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].address, "a0");
    }

    #[test]
    fn delete_where_removes_rows() {
        let db = test_db();
        db.update(|tx| {
            tx.save(&addr("a0", 0, false))?;
            tx.save(&addr("a1", 1, false))
        })
        .unwrap();

        let deleted = db
            .update(|tx| tx.delete_where::<AddressRecord>(&[("address", "a1".to_string().into())]))
            .unwrap();
        assert_eq!(deleted, 1);

        let left: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert_eq!(left.len(), 1);
    }

    #[test]
    fn failed_update_rolls_back() {
        let db = test_db();
        let result: Result<(), WalletError> = db.update(|tx| {
            tx.save(&addr("ghost", 9, false))?;
            Err(WalletError::NotFound("forced".into()))
        });
        assert!(result.is_err());

        // Nothing written by the failed closure is visible afterwards.
        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn dropped_manual_tx_rolls_back() {
        let db = test_db();
        {
            let mut tx = db.begin().unwrap();
            tx.save(&addr("ghost", 9, false)).unwrap();
            // Dropped without commit.
        }
        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn manual_commit_persists_and_runs_hook() {
        let db = test_db();
        let fired = Arc::new(AtomicBool::new(false));

        let mut tx = db.begin().unwrap();
        tx.save(&addr("a0", 0, false)).unwrap();
        let fired_clone = fired.clone();
        tx.on_commit(move || {
            fired_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        tx.commit().unwrap();

        assert!(fired.load(Ordering::SeqCst));
        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn rollback_discards_hooks() {
        let db = test_db();
        let fired = Arc::new(AtomicBool::new(false));

        let mut tx = db.begin().unwrap();
        tx.save(&addr("a0", 0, false)).unwrap();
        let fired_clone = fired.clone();
        tx.on_commit(move || {
            fired_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        tx.rollback().unwrap();

        assert!(!fired.load(Ordering::SeqCst));
        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn hook_failure_surfaces_but_commit_stands() {
        let db = test_db();

        let mut tx = db.begin().unwrap();
        tx.save(&addr("a0", 0, false)).unwrap();
        tx.on_commit(|| Err(WalletError::Broadcast("relay refused".into())));
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, WalletError::Broadcast(_)));

        // The local write is durable despite the hook failure.
        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn hook_can_reopen_database() {
        // Hooks run after the connection lock is released, so a hook that
        // opens its own transaction must not deadlock.
        let db = Arc::new(test_db());

        let mut tx = db.begin().unwrap();
        tx.save(&addr("a0", 0, false)).unwrap();
        let db_clone = db.clone();
        tx.on_commit(move || db_clone.update(|tx| tx.save(&addr("a1", 1, false))));
        tx.commit().unwrap();

        let found: Vec<AddressRecord> = db.view(|tx| tx.find_where(&[])).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn hooks_run_in_registration_order_and_stop_on_error() {
        let db = test_db();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tx = db.begin().unwrap();
        let o1 = order.clone();
        tx.on_commit(move || {
            o1.lock().push(1);
            Ok(())
        });
        let o2 = order.clone();
        tx.on_commit(move || {
            o2.lock().push(2);
            Err(WalletError::Broadcast("down".into()))
        });
        let o3 = order.clone();
        tx.on_commit(move || {
            o3.lock().push(3);
            Ok(())
        });
        assert!(tx.commit().is_err());
        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
