//! Durable idempotency store.
//!
//! Two tables: `completed` records which (context, item) pairs are done and
//! only ever grows; `contexts` caches discovered account contexts and is
//! upserted by key. Every call goes through one connection mutex so the
//! operator surface and the worker thread never interleave statements.

use crate::models::{ContextEntry, ContextId, ItemId};
use rusqlite::{Connection, OptionalExtension, params};
use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} failed: {source}")]
    Sqlite {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error("create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    fn sqlite(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Sqlite { operation, source }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS completed (
    context_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    completed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (context_id, item_id)
);

CREATE TABLE IF NOT EXISTS contexts (
    context_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    link TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct IdempotencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdempotencyStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StoreError::sqlite("open database"))?;
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(StoreError::sqlite("set journal_mode"))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(
                target = "reupload.store",
                journal_mode = %journal_mode,
                "sqlite kept a non-WAL journal mode"
            );
        }
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::sqlite("open database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(StoreError::sqlite("configure pragmas"))?;
        conn.execute_batch(SCHEMA)
            .map_err(StoreError::sqlite("create schema"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Marks `item` done for `context`. Repeated calls leave a single row.
    pub fn record_completion(&self, context: &ContextId, item: &ItemId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO completed (context_id, item_id) VALUES (?1, ?2)",
                params![context.as_str(), item.as_str()],
            )
            .map_err(StoreError::sqlite("record completion"))?;
        debug!(
            target = "reupload.store",
            context_id = %context,
            item_id = %item,
            inserted = inserted == 1,
            "record_completion"
        );
        Ok(())
    }

    pub fn is_completed(&self, context: &ContextId, item: &ItemId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM completed WHERE context_id = ?1 AND item_id = ?2",
                params![context.as_str(), item.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::sqlite("check completion"))?;
        Ok(row.is_some())
    }

    /// Records many items in one transaction; returns how many were new.
    pub fn bulk_record(&self, context: &ContextId, items: &[ItemId]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(StoreError::sqlite("begin bulk record"))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare("INSERT OR IGNORE INTO completed (context_id, item_id) VALUES (?1, ?2)")
                .map_err(StoreError::sqlite("prepare bulk record"))?;
            for item in items {
                inserted += stmt
                    .execute(params![context.as_str(), item.as_str()])
                    .map_err(StoreError::sqlite("bulk record"))?;
            }
        }
        tx.commit().map_err(StoreError::sqlite("commit bulk record"))?;
        Ok(inserted)
    }

    pub fn completed_items(&self, context: &ContextId) -> Result<Vec<ItemId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT item_id FROM completed WHERE context_id = ?1 ORDER BY completed_at, item_id")
            .map_err(StoreError::sqlite("prepare completed items"))?;
        let rows = stmt
            .query_map(params![context.as_str()], |row| row.get::<_, String>(0))
            .map_err(StoreError::sqlite("query completed items"))?;
        rows.map(|row| row.map(ItemId::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::sqlite("read completed items"))
    }

    /// Upserts every entry by context id. Entries missing from `entries`
    /// stay in the cache.
    pub fn replace_context_cache(&self, entries: &[ContextEntry]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(StoreError::sqlite("begin context save"))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO contexts (context_id, name, link) VALUES (?1, ?2, ?3)",
                )
                .map_err(StoreError::sqlite("prepare context save"))?;
            for entry in entries {
                stmt.execute(params![entry.context_id.as_str(), entry.name, entry.link])
                    .map_err(StoreError::sqlite("save context"))?;
            }
        }
        tx.commit().map_err(StoreError::sqlite("commit context save"))?;
        Ok(())
    }

    pub fn load_context_cache(&self) -> Result<Vec<ContextEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT context_id, name, link FROM contexts ORDER BY context_id")
            .map_err(StoreError::sqlite("prepare context load"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ContextEntry {
                    context_id: ContextId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    link: row.get(2)?,
                })
            })
            .map_err(StoreError::sqlite("query contexts"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::sqlite("read contexts"))
    }

    #[cfg(test)]
    pub(crate) fn completed_count(&self, context: &ContextId, item: &ItemId) -> i64 {
        let conn = self.lock().expect("lock");
        conn.query_row(
            "SELECT COUNT(*) FROM completed WHERE context_id = ?1 AND item_id = ?2",
            params![context.as_str(), item.as_str()],
            |row| row.get(0),
        )
        .expect("count")
    }

    /// Drops the `completed` table so later writes fail; used to exercise
    /// the "storage failure is not fatal" path.
    #[cfg(test)]
    pub(crate) fn break_completed_table(&self) {
        let conn = self.lock().expect("lock");
        conn.execute_batch("DROP TABLE completed;").expect("drop");
    }
}
