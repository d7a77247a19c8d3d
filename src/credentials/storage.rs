//! Tenant connection persistence using SQLite.
//!
//! The store never sees plaintext secrets; callers seal them with
//! [`super::SecretCodec`] before writing.

use super::{RotatedTokens, TenantConnection};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Connection rows backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE connections (
///     tenant_id     INTEGER PRIMARY KEY,
///     realm_id      TEXT NOT NULL,   -- Encrypted
///     access_token  TEXT NOT NULL,   -- Encrypted
///     refresh_token TEXT NOT NULL,   -- Encrypted
///     expires_at    TEXT NOT NULL,   -- ISO 8601 timestamp
///     created_at    TEXT NOT NULL,
///     updated_at    TEXT NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - The guard is never held across an await point
pub struct ConnectionStore {
    conn: Mutex<Connection>,
}

impl ConnectionStore {
    /// Creates or opens the store and ensures the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                tenant_id INTEGER PRIMARY KEY,
                realm_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create connections table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("connection store lock poisoned"))
    }

    /// Inserts the tenant's connection or overwrites the existing one.
    pub fn upsert(&self, connection: &TenantConnection) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.lock()?
            .execute(
                r#"
                INSERT INTO connections (
                    tenant_id, realm_id, access_token, refresh_token,
                    expires_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(tenant_id) DO UPDATE SET
                    realm_id = excluded.realm_id,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    connection.tenant_id,
                    connection.realm_id,
                    connection.access_token,
                    connection.refresh_token,
                    connection.expires_at.to_rfc3339(),
                    now,
                    now,
                ],
            )
            .context("Failed to store connection")?;

        Ok(())
    }

    /// Retrieves the tenant's connection row, if any.
    pub fn get(&self, tenant_id: i64) -> Result<Option<TenantConnection>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT realm_id, access_token, refresh_token, expires_at
                FROM connections
                WHERE tenant_id = ?1
                "#,
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read connection")?;

        let Some((realm_id, access_token, refresh_token, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Failed to parse expires_at for tenant {}", tenant_id))?;

        Ok(Some(TenantConnection {
            tenant_id,
            realm_id,
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    /// Returns true if the tenant has a connection row.
    pub fn exists(&self, tenant_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT 1 FROM connections WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check connection")?;
        Ok(found.is_some())
    }

    /// Writes rotated secrets in a single statement, but only while the row
    /// still holds `expected_refresh_token` (the sealed value the refresh
    /// read).
    ///
    /// Returns `Ok(false)` if the row vanished or was replaced by a reconnect
    /// in the meantime; nothing is written in that case.
    pub fn rotate(
        &self,
        tenant_id: i64,
        expected_refresh_token: &str,
        rotated: &RotatedTokens,
    ) -> Result<bool> {
        let rows_affected = self
            .lock()?
            .execute(
                r#"
                UPDATE connections SET
                    realm_id = ?3,
                    access_token = ?4,
                    refresh_token = ?5,
                    expires_at = ?6,
                    updated_at = ?7
                WHERE tenant_id = ?1 AND refresh_token = ?2
                "#,
                params![
                    tenant_id,
                    expected_refresh_token,
                    rotated.realm_id,
                    rotated.access_token,
                    rotated.refresh_token,
                    rotated.expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to persist rotated tokens")?;

        Ok(rows_affected > 0)
    }

    /// Deletes the tenant's connection.
    ///
    /// # Returns
    /// * `Ok(true)` - Row deleted
    /// * `Ok(false)` - No row existed
    pub fn delete(&self, tenant_id: i64) -> Result<bool> {
        let rows_affected = self
            .lock()?
            .execute(
                "DELETE FROM connections WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .context("Failed to delete connection")?;

        Ok(rows_affected > 0)
    }

    /// Lists tenant ids with a stored connection.
    pub fn list_tenants(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT tenant_id FROM connections ORDER BY tenant_id")
            .context("Failed to prepare query")?;

        let tenants = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<i64>, _>>()
            .context("Failed to read results")?;

        Ok(tenants)
    }
}
