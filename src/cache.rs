//! SQLite-backed key/value cache.
//!
//! Values are JSON documents stored next to a small metadata document
//! that carries the freshness windows. The same database file also
//! holds the page view log, so a single instance owns exactly one file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use spdlog::warn;

use crate::cluster::{ClusterState, PeerClient, Role};
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache (
    key      TEXT PRIMARY KEY,
    metadata TEXT NOT NULL,
    value    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS views (
    id         TEXT PRIMARY KEY,
    client_id  TEXT NOT NULL,
    slug       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS views_by_slug ON views (slug);
CREATE INDEX IF NOT EXISTS views_by_client ON views (client_id, slug, created_at);
";

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Expired,
}

/// Freshness windows of a cache entry, all in milliseconds.
/// `ttl: None` means the value never goes stale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub created_time: i64,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub swr: Option<i64>,
}

impl CacheMetadata {
    pub fn new(ttl: Option<i64>, swr: Option<i64>) -> Self {
        CacheMetadata {
            created_time: now_ms(),
            ttl,
            swr,
        }
    }

    pub fn state(&self, now: i64) -> EntryState {
        let Some(ttl) = self.ttl else {
            return EntryState::Fresh;
        };
        let fresh_until = self.created_time + ttl;
        if now <= fresh_until {
            EntryState::Fresh
        } else if now <= fresh_until + self.swr.unwrap_or(0) {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }
}

/// A stored value together with its freshness metadata. This is also
/// the wire shape replicated between instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub metadata: CacheMetadata,
    pub value: serde_json::Value,
}

impl CacheEntry {
    pub fn new(value: serde_json::Value, ttl: Option<i64>, swr: Option<i64>) -> Self {
        CacheEntry {
            metadata: CacheMetadata::new(ttl, swr),
            value,
        }
    }

    pub fn state(&self, now: i64) -> EntryState {
        self.metadata.state(now)
    }
}

/// Owns the SQLite connection. Calls are short and never await while
/// the connection is locked, so a plain mutex is enough.
pub struct CacheDb {
    pub(crate) conn: Mutex<Connection>,
}

impl CacheDb {
    pub fn open(path: &Path) -> Result<CacheDb> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(CacheDb {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<CacheDb> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(CacheDb {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT metadata, value FROM cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
        };
        let Some((metadata, value)) = row else {
            return Ok(None);
        };
        match (
            serde_json::from_str::<CacheMetadata>(&metadata),
            serde_json::from_str::<serde_json::Value>(&value),
        ) {
            (Ok(metadata), Ok(value)) => Ok(Some(CacheEntry { metadata, value })),
            _ => {
                // An unreadable row can only poison every later lookup,
                // drop it and treat the key as absent.
                warn!("Dropping unreadable cache entry for key {}", key);
                let _ = self.delete(key)?;
                Ok(None)
            }
        }
    }

    pub fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        let value = serde_json::to_string(&entry.value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cache (key, metadata, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET metadata = excluded.metadata, value = excluded.value",
            params![key, metadata, value],
        )?;
        Ok(())
    }

    /// Returns `true` if a row was deleted.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
        Ok(changed > 0)
    }

    /// Cheap liveness check for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Cluster-aware cache handle used by everything above the store.
///
/// Reads are always local. Writes depend on the instance role: the
/// primary writes to its own database, a replica forwards the write to
/// the primary and relies on file replication to bring the result back.
pub struct Cache {
    db: Arc<CacheDb>,
    cluster: ClusterState,
    peers: PeerClient,
    flights: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl Cache {
    pub fn new(db: Arc<CacheDb>, cluster: ClusterState, peers: PeerClient) -> Self {
        Cache {
            db,
            cluster,
            peers,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Arc<CacheDb> {
        &self.db
    }

    pub fn role(&self) -> Role {
        self.cluster.role()
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.db.get(key)
    }

    pub fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        match self.cluster.role() {
            Role::Primary => self.db.set(key, &entry),
            Role::Replica { primary_hostname } => {
                let url = self.cluster.primary_url(&primary_hostname);
                self.peers.spawn_set(url, key.to_string(), entry);
                Ok(())
            }
        }
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        match self.cluster.role() {
            Role::Primary => self.db.delete(key),
            Role::Replica { primary_hostname } => {
                let url = self.cluster.primary_url(&primary_hostname);
                self.peers.spawn_delete(url, key.to_string());
                Ok(false)
            }
        }
    }

    /// Write to the local database regardless of role. Only the
    /// replication endpoint should need this.
    pub fn set_local(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.db.set(key, entry)
    }

    /// Delete from the local database regardless of role.
    pub fn delete_local(&self, key: &str) -> Result<bool> {
        self.db.delete(key)
    }

    /// Per-key async lock so only one refresh of a key runs at a time
    /// in this process. Locks are created on demand and dropped with
    /// their last holder.
    pub fn flight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap();

        if flights.len() > 128 {
            flights.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = flights.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let _ = flights.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }
}
