//! Company alias persistence using SQLite.
//!
//! Legacy company identifiers map onto the canonical tenant id that owns
//! credentials. Ids without a row are their own canonical id.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Persists alias → canonical company mappings.
pub struct CompanyDirectory {
    conn: Mutex<Connection>,
}

impl CompanyDirectory {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open company directory DB")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS company_aliases (
                alias_id     INTEGER PRIMARY KEY,
                canonical_id INTEGER NOT NULL
            );",
        )
        .context("Failed to create company_aliases table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("company directory lock poisoned"))
    }

    /// Records that `alias_id` belongs to `canonical_id`. Replaces any
    /// previous mapping for the alias.
    pub fn set_alias(&self, alias_id: i64, canonical_id: i64) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO company_aliases (alias_id, canonical_id) VALUES (?1, ?2)
                 ON CONFLICT(alias_id) DO UPDATE SET canonical_id = excluded.canonical_id",
                params![alias_id, canonical_id],
            )
            .context("Failed to store company alias")?;
        Ok(())
    }

    /// Removes an alias. Returns Ok(()) whether or not the row exists.
    pub fn remove_alias(&self, alias_id: i64) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM company_aliases WHERE alias_id = ?1",
                params![alias_id],
            )
            .context("Failed to delete company alias")?;
        Ok(())
    }

    /// Canonical id for `company_id`; the id itself when no alias exists.
    pub fn canonical_id(&self, company_id: i64) -> Result<i64> {
        let canonical: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT canonical_id FROM company_aliases WHERE alias_id = ?1",
                params![company_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up company alias")?;
        Ok(canonical.unwrap_or(company_id))
    }
}
