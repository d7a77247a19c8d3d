//! Access token lifecycle.
//!
//! [`TokenLifecycleManager::ensure_fresh_access`] turns a stored connection
//! row into a usable [`AccessContext`], refreshing first when the access
//! token is inside the refresh buffer.
//!
//! # Refresh serialization
//!
//! The platform invalidates a refresh token the moment it is used, so two
//! concurrent refreshes for one tenant would leave the slower one holding a
//! dead token. Refreshes are therefore single-flight per tenant:
//!
//! ```text
//! caller A ──┐                     ┌─> lock ─> re-read row ─> refresh ─> rotate ─> ctx
//!            ├─ expiring? ─ spawn ─┤
//! caller B ──┘                     └─> wait ─> re-read row (fresh) ─────────────> ctx
//! ```
//!
//! The refresh body runs in its own task, so a caller that goes away does
//! not abandon a refresh halfway; the rotated tokens are persisted either
//! way and the next caller picks them up.

use crate::credentials::{ConnectionStore, RotatedTokens, SecretCodec, TenantConnection};
use crate::egress::EgressGateway;
use crate::error::{IntegrationError, Result};
use crate::oauth::exchange::{self, ClientCredentials};
use crate::oauth::PlatformEndpoints;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};


/// Default refresh buffer (5 minutes)
pub const DEFAULT_REFRESH_BUFFER_SECONDS: i64 = 300;

/// How long waiters reuse a failed refresh outcome instead of retrying
const FAILURE_MEMO: std::time::Duration = std::time::Duration::from_secs(10);

/// Decrypted, ready-to-use credentials for one request.
///
/// Never persisted. Secret fields are wiped when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessContext {
    realm_id: String,
    access_token: String,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl AccessContext {
    pub fn new(realm_id: String, access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            realm_id,
            access_token,
            expires_at,
        }
    }

    pub fn realm_id(&self) -> &str {
        &self.realm_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl std::fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessContext")
            .field("realm_id", &self.realm_id)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Last failed refresh for a tenant, shared with callers queued behind it.
struct FailedRefresh {
    /// Sealed refresh token the attempt used
    refresh_token: String,
    status: Option<u16>,
    reason: String,
    at: Instant,
}

#[derive(Default)]
struct Flight {
    last_failure: Option<FailedRefresh>,
}

struct Inner {
    store: Arc<ConnectionStore>,
    codec: SecretCodec,
    gateway: Arc<EgressGateway>,
    endpoints: PlatformEndpoints,
    client: Option<ClientCredentials>,
    refresh_buffer: Duration,
    flights: DashMap<i64, Arc<Mutex<Flight>>>,
}

/// Hands out fresh access tokens, refreshing and rotating as needed.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<ConnectionStore>,
        codec: SecretCodec,
        gateway: Arc<EgressGateway>,
        endpoints: PlatformEndpoints,
        client: Option<ClientCredentials>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                codec,
                gateway,
                endpoints,
                client,
                refresh_buffer,
                flights: DashMap::new(),
            }),
        }
    }

    /// True when the token expires within the refresh buffer.
    pub fn is_expiring_soon(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.inner.is_expiring_soon(expires_at, now)
    }

    /// Returns a currently valid access context for `tenant_id`.
    ///
    /// # Errors
    /// * `RefreshFailed` - the platform rejected the refresh (or could not be
    ///   reached); the stored row is left untouched
    /// * `MissingClientCredentials` - refresh needed but client id/secret unset
    /// * `NotConnected` - the row disappeared before the refresh completed
    ///
    /// A reconnect that lands while a refresh is in flight is never
    /// overwritten; its tokens are returned instead.
    pub async fn ensure_fresh_access(
        &self,
        connection: &TenantConnection,
        tenant_id: i64,
    ) -> Result<AccessContext> {
        if !self.is_expiring_soon(connection.expires_at, Utc::now()) {
            return self.inner.open(connection);
        }

        debug!(tenant_id, expires_at = %connection.expires_at, "Access token expiring soon");

        let inner = Arc::clone(&self.inner);
        let flight = tokio::spawn(async move { inner.refresh_serialized(tenant_id).await });

        flight.await.map_err(|e| {
            error!(tenant_id, error = %e, "Refresh task did not complete");
            IntegrationError::RefreshFailed {
                status: None,
                reason: "refresh task aborted".to_string(),
            }
        })?
    }
}

impl Inner {
    fn is_expiring_soon(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at - now <= self.refresh_buffer
    }

    /// Decrypts the row's realm and access token.
    fn open(&self, connection: &TenantConnection) -> Result<AccessContext> {
        let realm_id = self.codec.decrypt(&connection.realm_id)?;
        let access_token = self.codec.decrypt(&connection.access_token)?;
        Ok(AccessContext::new(
            realm_id.to_string(),
            access_token.to_string(),
            connection.expires_at,
        ))
    }

    async fn refresh_serialized(&self, tenant_id: i64) -> Result<AccessContext> {
        let flight = Arc::clone(self.flights.entry(tenant_id).or_default().value());
        let mut flight = flight.lock().await;

        // Another flight may have rotated the row while we waited
        let current = self
            .store
            .get(tenant_id)?
            .ok_or(IntegrationError::NotConnected(tenant_id))?;
        if !self.is_expiring_soon(current.expires_at, Utc::now()) {
            debug!(tenant_id, "Token already refreshed by a concurrent request");
            return self.open(&current);
        }

        if let Some(failure) = &flight.last_failure {
            if failure.refresh_token == current.refresh_token && failure.at.elapsed() < FAILURE_MEMO
            {
                debug!(tenant_id, "Reusing outcome of the refresh that just failed");
                return Err(IntegrationError::RefreshFailed {
                    status: failure.status,
                    reason: failure.reason.clone(),
                });
            }
        }

        let client = self.client.as_ref().ok_or_else(|| {
            error!(tenant_id, "Token refresh needed but OAuth client credentials are not configured");
            IntegrationError::MissingClientCredentials
        })?;

        let realm_id = self.codec.decrypt(&current.realm_id)?;
        let refresh_token = self.codec.decrypt(&current.refresh_token)?;

        info!(tenant_id, "Refreshing access token");

        let grant = match exchange::refresh(&self.gateway, &self.endpoints, client, &refresh_token)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                if let IntegrationError::RefreshFailed { status, reason } = &e {
                    warn!(tenant_id, status = ?status, reason = %reason, "Token refresh rejected, reconnect required");
                    flight.last_failure = Some(FailedRefresh {
                        refresh_token: current.refresh_token.clone(),
                        status: *status,
                        reason: reason.clone(),
                        at: Instant::now(),
                    });
                } else {
                    error!(tenant_id, error = %e, "Token refresh could not be attempted");
                }
                return Err(e);
            }
        };

        let expires_at = grant.expires_at(Utc::now()).ok_or_else(|| IntegrationError::RefreshFailed {
            status: None,
            reason: exchange::INVALID_LIFETIME.to_string(),
        })?;
        let rotated = RotatedTokens {
            realm_id: self.codec.encrypt(&realm_id)?,
            access_token: self.codec.encrypt(&grant.access_token)?,
            refresh_token: self.codec.encrypt(&grant.refresh_token)?,
            expires_at,
        };

        match self.store.rotate(tenant_id, &current.refresh_token, &rotated) {
            Ok(true) => {}
            Ok(false) => {
                // Reconnected or disconnected while the refresh was out; the
                // newer row wins
                return match self.store.get(tenant_id)? {
                    Some(replacement) => {
                        warn!(tenant_id, "Connection replaced during refresh, discarding rotated tokens");
                        self.open(&replacement)
                    }
                    None => {
                        warn!(tenant_id, "Connection removed during refresh, discarding rotated tokens");
                        Err(IntegrationError::NotConnected(tenant_id))
                    }
                };
            }
            Err(e) => {
                // The previous refresh token is already spent at the platform
                error!(tenant_id, error = %e, "Failed to persist rotated tokens");
                return Err(e.into());
            }
        }

        flight.last_failure = None;
        info!(tenant_id, expires_at = %expires_at, "Access token refreshed");

        Ok(AccessContext::new(
            realm_id.to_string(),
            grant.access_token.clone(),
            expires_at,
        ))
    }
}
