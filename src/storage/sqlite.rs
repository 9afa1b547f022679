use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::{Deserialize, Serialize};

use super::kv::{KvStore, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistRow {
    pub id: i64,
    pub address: String,
    pub cidr: Option<String>,
    pub reason: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEventRow {
    pub id: i64,
    pub kind: String,
    pub actor: String,
    pub details: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Durable store for counters, blacklist entries, and audit events.
///
/// All timestamps are epoch seconds. Expiry is enforced on read and by
/// [`purge_expired`](SqliteStore::purge_expired); the `Mutex<Connection>`
/// makes every read-modify-write atomic, and `busy_timeout` bounds how
/// long a caller may block.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                expires_at  INTEGER
            );

            CREATE TABLE IF NOT EXISTS blacklist (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                address     TEXT NOT NULL UNIQUE,
                cidr        TEXT,
                reason      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                expires_at  INTEGER
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                kind        TEXT NOT NULL,
                actor       TEXT NOT NULL,
                details     TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_kind_time
                ON audit_events (kind, created_at);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -----------------------------------------------------------------------
    // Blacklist rows
    // -----------------------------------------------------------------------

    pub fn add_blacklist_entry(
        &self,
        address: &str,
        cidr: Option<&str>,
        reason: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute(
            "INSERT INTO blacklist (address, cidr, reason, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(address) DO UPDATE SET
                 reason = excluded.reason,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
            params![address, cidr, reason, Utc::now().timestamp(), expires_at],
        )?;
        Ok(())
    }

    pub fn remove_blacklist_entry(&self, address: &str) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute("DELETE FROM blacklist WHERE address = ?1", params![address])?;
        Ok(())
    }

    pub fn get_blacklist_entries(&self) -> Result<Vec<BlacklistRow>> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, address, cidr, reason, created_at, expires_at FROM blacklist",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BlacklistRow {
                id: row.get(0)?,
                address: row.get(1)?,
                cidr: row.get(2)?,
                reason: row.get(3)?,
                created_at: row.get(4)?,
                expires_at: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    // -----------------------------------------------------------------------
    // Audit rows
    // -----------------------------------------------------------------------

    pub fn insert_audit_event(
        &self,
        kind: &str,
        actor: &str,
        details: &str,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute(
            "INSERT INTO audit_events (kind, actor, details, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind, actor, details, now, now + ttl.as_secs() as i64],
        )?;
        Ok(())
    }

    pub fn count_audit_events(&self, kind: &str, since_epoch: i64) -> Result<u64> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_events WHERE kind = ?1 AND created_at >= ?2",
            params![kind, since_epoch],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEventRow>> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, kind, actor, details, created_at, expires_at
             FROM audit_events ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AuditEventRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                actor: row.get(2)?,
                details: row.get(3)?,
                created_at: row.get(4)?,
                expires_at: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Delete expired kv rows, blacklist entries, and audit events.
    /// Called from the background cleanup task.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        let mut purged = 0;
        purged += conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        purged += conn.execute(
            "DELETE FROM blacklist WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        purged += conn.execute(
            "DELETE FROM audit_events WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(purged)
    }
}

fn map_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl KvStore for SqliteStore {
    fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        // An expired row must count from zero again.
        conn.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )
        .map_err(map_err)?;
        let value: i64 = conn
            .query_row(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                     value = CAST(CAST(kv.value AS INTEGER) + ?2 AS TEXT)
                 RETURNING CAST(value AS INTEGER)",
                params![key, delta],
                |row| row.get(0),
            )
            .map_err(map_err)?;
        Ok(value)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.query_row(
            "SELECT value FROM kv
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_err)
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute(
            "UPDATE kv SET expires_at = ?2 WHERE key = ?1",
            params![key, expires_at],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(map_err)?;
        Ok(())
    }

    fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        let expires_at: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at FROM kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_err)?;
        Ok(expires_at
            .flatten()
            .map(|exp| Duration::from_secs((exp - now).max(0) as u64)))
    }
}
