//! Durable persistence of discovered routes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rusqlite::Connection;

use super::RelayRoute;
use super::schema;
use crate::error::{Error, Result};

/// Checkpoint key for the last completed discovery run.
pub const LAST_DISCOVERY_KEY: &str = "last_discovery_at";

/// SQLite-backed route store.
///
/// All access goes through a single connection behind a mutex; route writes
/// happen inside transactions so a user's route set is replaced atomically.
pub struct RouteStore {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
}

impl RouteStore {
    /// Open or create a route store at the given path.
    pub fn open(db_path: &PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open SQLite: {}", e)))?;

        // WAL mode for better concurrency between the writer and readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory SQLite: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace a user's route set wholesale with `routes`.
    ///
    /// Not a merge: stale relay entries for the user are dropped when a
    /// fresher preference document supersedes them. Routes with neither
    /// read nor write are discarded. Returns the number of routes written.
    pub fn upsert_routes(&self, pubkey: &str, routes: &[RelayRoute]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute("DELETE FROM routes WHERE pubkey = ?", [pubkey])
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut written = 0usize;
        let mut dropped = 0usize;
        let mut seen: HashSet<&str> = HashSet::new();

        for route in routes {
            if route.pubkey != pubkey {
                tracing::debug!(
                    "skipping route for {} in upsert for {}",
                    route.pubkey,
                    pubkey
                );
                continue;
            }
            if !route.is_usable() {
                dropped += 1;
                continue;
            }
            // One row per (pubkey, relay_url); first occurrence wins.
            if !seen.insert(route.relay_url.as_str()) {
                continue;
            }

            tx.execute(
                "INSERT INTO routes (pubkey, relay_url, can_read, can_write, discovered_at)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    route.pubkey,
                    route.relay_url,
                    route.can_read as i64,
                    route.can_write as i64,
                    route.discovered_at as i64,
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
            written += 1;
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        counter!("routes_upserted_total").increment(written as u64);
        if dropped > 0 {
            counter!("routes_dropped_total").increment(dropped as u64);
        }

        Ok(written)
    }

    /// Get all routes for a user.
    ///
    /// Returns an empty vec (not an error) if the user was never discovered.
    pub fn get_routes(&self, pubkey: &str) -> Result<Vec<RelayRoute>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT pubkey, relay_url, can_read, can_write, discovered_at
                 FROM routes WHERE pubkey = ? ORDER BY relay_url",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let routes: Vec<RelayRoute> = stmt
            .query_map([pubkey], |row| {
                Ok(RelayRoute {
                    pubkey: row.get(0)?,
                    relay_url: row.get(1)?,
                    can_read: row.get::<_, i64>(2)? != 0,
                    can_write: row.get::<_, i64>(3)? != 0,
                    discovered_at: row.get::<_, i64>(4)? as u64,
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(routes)
    }

    /// All users present in the routing table.
    ///
    /// An empty result marks a cold table, which forces discovery regardless
    /// of freshness rules.
    pub fn all_users(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT pubkey FROM routes ORDER BY pubkey")
            .map_err(|e| Error::Database(e.to_string()))?;

        let users: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();

        gauge!("routes_users").set(users.len() as f64);
        Ok(users)
    }

    /// Whether the routing table has no users at all.
    pub fn is_empty(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(DISTINCT pubkey) FROM routes", [], |row| {
                row.get(0)
            })
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count == 0)
    }

    /// Explicit cache-clear: drop every route and checkpoint.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM routes", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.execute("DELETE FROM discovery_state", [])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Unix time of the last completed discovery run, if any.
    pub fn last_discovery_at(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM discovery_state WHERE key = ?",
                [LAST_DISCOVERY_KEY],
                |row| row.get(0),
            )
            .ok();
        Ok(value.map(|v| v as u64))
    }

    /// Record the completion time of a discovery run.
    pub fn set_last_discovery_at(&self, timestamp: u64) -> Result<()> {
        let now = unix_now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO discovery_state (key, value, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![LAST_DISCOVERY_KEY, timestamp as i64, now],
        )
        .map_err(|e| Error::Database(format!("failed to update checkpoint: {}", e)))?;
        Ok(())
    }
}

/// Current Unix timestamp.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
