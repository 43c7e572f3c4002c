use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::errors::SinkError;
use crate::models::Record;

/// Destination for ingested batches
pub trait RecordSink {
    /// Persist a whole batch atomically, returning how many records were written.
    /// Re-sending an id replaces its star count and timestamps.
    fn upsert_batch(&mut self, records: &[Record]) -> Result<usize, SinkError>;
}

/// Stored repository row
#[derive(Debug, Clone)]
pub struct StoredRepo {
    pub name: String,
    pub owner: String,
    pub stars: u64,
    pub fetched_at: String,
}

/// Aggregate view of the store
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub repos: usize,
    pub owners: usize,
    pub total_stars: u64,
    pub last_fetched_at: Option<String>,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Another crawler (or a reader) may hold the lock briefly
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let db = Self {
            conn,
            path: db_path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database for testing
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory database")?;

        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checkpoint WAL to merge pending writes into main DB file
    /// Uses PASSIVE mode which doesn't block other connections
    pub fn checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS repositories (
                node_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                stars_count INTEGER NOT NULL DEFAULT 0 CHECK (stars_count >= 0),
                updated_at TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repositories_owner ON repositories(owner);
            CREATE INDEX IF NOT EXISTS idx_repositories_stars ON repositories(stars_count DESC);
            ",
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Row counts and star totals
    pub fn stats(&self) -> Result<StoreStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT owner), COALESCE(SUM(stars_count), 0), MAX(fetched_at)
             FROM repositories",
            [],
            |row| {
                Ok(StoreStats {
                    repos: row.get::<_, i64>(0)? as usize,
                    owners: row.get::<_, i64>(1)? as usize,
                    total_stars: row.get::<_, i64>(2)? as u64,
                    last_fetched_at: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Most-starred repositories
    pub fn top_repos(&self, limit: usize) -> Result<Vec<StoredRepo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, owner, stars_count, fetched_at
             FROM repositories
             ORDER BY stars_count DESC, node_id
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], row_to_repo)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Look up one repository by node id
    #[cfg(test)]
    pub fn get_repo(&self, node_id: &str) -> Result<Option<StoredRepo>> {
        let repo = self
            .conn
            .query_row(
                "SELECT name, owner, stars_count, fetched_at
                 FROM repositories WHERE node_id = ?1",
                params![node_id],
                row_to_repo,
            )
            .optional()?;
        Ok(repo)
    }
}

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRepo> {
    Ok(StoredRepo {
        name: row.get(0)?,
        owner: row.get(1)?,
        stars: row.get::<_, i64>(2)? as u64,
        fetched_at: row.get(3)?,
    })
}

impl RecordSink for Database {
    fn upsert_batch(&mut self, records: &[Record]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        // Dropping the transaction without commit rolls the whole batch back
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO repositories (node_id, name, owner, stars_count, updated_at, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(node_id) DO UPDATE SET
                    stars_count = excluded.stars_count,
                    updated_at = excluded.updated_at,
                    fetched_at = excluded.fetched_at",
            )?;

            for record in records {
                let stars = i64::try_from(record.star_count).map_err(|_| SinkError::InvalidRecord {
                    id: record.id.clone(),
                    reason: format!("star count {} out of range", record.star_count),
                })?;

                stmt.execute(params![
                    record.id,
                    record.name,
                    record.owner,
                    stars,
                    record.updated_at.to_rfc3339(),
                    record.fetched_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;

        Ok(records.len())
    }
}
