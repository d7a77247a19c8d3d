//! Encrypted tenant connection storage.
//!
//! Holds one connection row per tenant. Secret columns (realm id, access
//! token, refresh token) are stored as AES-256-GCM envelopes produced by
//! [`SecretCodec`]; only the expiry timestamp is plaintext.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  TokenLifecycleManager / Connection     │
//! │  - decrypt on read, encrypt on write    │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretCodec                       │
//! │  - AES-256-GCM, unique nonce per seal   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       ConnectionStore (SQLite)          │
//! │  - ciphertext only                      │
//! │  - single-statement rotation            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use ledgerlink::credentials::{ConnectionStore, SecretCodec, TenantConnection};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("LEDGERLINK_ENCRYPTION_KEY")?;
//! let codec = SecretCodec::from_key(Some(&key))?;
//! let store = ConnectionStore::new("ledgerlink.db")?;
//!
//! store.upsert(&TenantConnection {
//!     tenant_id: 42,
//!     realm_id: codec.encrypt("9130357993")?,
//!     access_token: codec.encrypt("access")?,
//!     refresh_token: codec.encrypt("refresh")?,
//!     expires_at: Utc::now() + Duration::hours(1),
//! })?;
//!
//! if let Some(row) = store.get(42)? {
//!     println!("realm: {}", codec.decrypt(&row.realm_id)?.as_str());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};

mod encryption;
mod storage;

pub use encryption::{validate_key, SecretCodec};
pub use storage::ConnectionStore;

/// Stored connection row for one tenant.
///
/// Secret fields hold ciphertext envelopes, never plaintext.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantConnection {
    pub tenant_id: i64,

    /// Encrypted platform realm identifier
    pub realm_id: String,

    /// Encrypted access token
    pub access_token: String,

    /// Encrypted refresh token
    pub refresh_token: String,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,
}

/// Freshly rotated secrets, already sealed, written back in one statement.
#[derive(Clone, Debug)]
pub struct RotatedTokens {
    pub realm_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}
