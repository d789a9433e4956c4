//! Persistent cache mapping city names to weather-provider location ids.
//!
//! Caching is best-effort: every storage fault degrades to a cold cache and is
//! logged, never returned. If the database cannot be opened at all the cache
//! runs disabled and every lookup misses.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS location_cache (
    city_name TEXT PRIMARY KEY,
    location_id TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

/// Format SQLite uses for `CURRENT_TIMESTAMP`.
const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A cached geocoding result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityCacheEntry {
    pub city_name: String,
    pub location_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Outcome of a best-effort cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
    Written,
    /// The write did not happen; the reason is informational only.
    Skipped(String),
}

impl CacheWrite {
    pub fn is_written(&self) -> bool {
        matches!(self, CacheWrite::Written)
    }
}

/// Thread-safe handle to the location cache. Cheap to clone.
#[derive(Clone)]
pub struct LocationCache {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl std::fmt::Debug for LocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationCache")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl LocationCache {
    /// Open (or create) the cache database at `path`.
    ///
    /// Creating the table when it already exists is a no-op, so calling this
    /// repeatedly against the same file is safe.
    pub fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::warn!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create cache directory, location cache disabled"
                );
                return Self::disabled();
            }
        }

        match Connection::open(path).and_then(|conn| Self::init(&conn).map(|_| conn)) {
            Ok(conn) => {
                tracing::info!(path = %path.display(), "Location cache ready");
                Self::from_connection(conn)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to open location cache, continuing without it"
                );
                Self::disabled()
            }
        }
    }

    /// Non-persistent cache, used by tests and as a fallback.
    pub fn in_memory() -> Self {
        match Connection::open_in_memory().and_then(|conn| Self::init(&conn).map(|_| conn)) {
            Ok(conn) => Self::from_connection(conn),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create in-memory location cache");
                Self::disabled()
            }
        }
    }

    /// A cache that stores nothing and always misses.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        }
    }

    fn init(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute(CREATE_TABLE_SQL, [])?;
        Ok(())
    }

    /// Look up the location id for `city_name`. Faults read as a miss.
    pub async fn get(&self, city_name: &str) -> Option<String> {
        let cache = self.clone();
        let city = city_name.to_string();
        let result = tokio::task::spawn_blocking(move || cache.get_blocking(&city)).await;

        let location_id = match result {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Location cache lookup task failed");
                None
            }
        };

        let outcome = if location_id.is_some() { "hit" } else { "miss" };
        metrics::counter!("location_cache_lookups_total", "outcome" => outcome).increment(1);
        location_id
    }

    /// Store `location_id` for `city_name`, replacing any previous row.
    pub async fn put(&self, city_name: &str, location_id: &str) -> CacheWrite {
        let cache = self.clone();
        let city = city_name.to_string();
        let id = location_id.to_string();

        match tokio::task::spawn_blocking(move || cache.put_blocking(&city, &id)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "Location cache write task failed");
                CacheWrite::Skipped(format!("write task failed: {}", e))
            }
        }
    }

    pub fn get_blocking(&self, city_name: &str) -> Option<String> {
        self.entry(city_name).map(|entry| entry.location_id)
    }

    pub fn put_blocking(&self, city_name: &str, location_id: &str) -> CacheWrite {
        let Some(conn) = &self.conn else {
            return CacheWrite::Skipped("cache disabled".to_string());
        };
        let Ok(conn) = conn.lock() else {
            tracing::warn!("Location cache lock poisoned, skipping write");
            return CacheWrite::Skipped("lock poisoned".to_string());
        };

        match conn.execute(
            "INSERT OR REPLACE INTO location_cache (city_name, location_id) VALUES (?1, ?2)",
            params![city_name, location_id],
        ) {
            Ok(_) => {
                tracing::debug!(city = city_name, location_id, "Location id cached");
                CacheWrite::Written
            }
            Err(e) => {
                tracing::warn!(city = city_name, error = %e, "Location cache write failed");
                CacheWrite::Skipped(e.to_string())
            }
        }
    }

    /// Full cache row for `city_name`, if present.
    pub fn entry(&self, city_name: &str) -> Option<CityCacheEntry> {
        let conn = self.conn.as_ref()?;
        let conn = conn.lock().ok()?;

        let row = conn
            .query_row(
                "SELECT city_name, location_id, created_at FROM location_cache WHERE city_name = ?1",
                params![city_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional();

        match row {
            Ok(Some((city_name, location_id, created_at))) => Some(CityCacheEntry {
                city_name,
                location_id,
                created_at: created_at.as_deref().and_then(parse_sqlite_timestamp),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(city = city_name, error = %e, "Location cache read failed");
                None
            }
        }
    }

    /// Number of cached cities. Zero when the cache is disabled or unreadable.
    pub fn len(&self) -> usize {
        let Some(conn) = &self.conn else {
            return 0;
        };
        let Ok(conn) = conn.lock() else {
            return 0;
        };
        conn.query_row("SELECT COUNT(*) FROM location_cache", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n.max(0) as usize)
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_sqlite_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, SQLITE_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
