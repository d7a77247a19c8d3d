//! Connection lifecycle.
//!
//! Ties the OAuth pieces, the credential store and the token manager into
//! the operations the HTTP layer and integration collaborators use:
//!
//! ```text
//! authorize ─> state ─> provider consent ─> callback ─> exchange ─> row
//!                                                                   │
//!          status / access / platform_get ─> ensure_fresh_access <──┤
//!                                                                   │
//!                                   disconnect ─> revoke ─> delete ─┘
//! ```

use crate::config::IntegrationConfig;
use crate::credentials::{ConnectionStore, SecretCodec, TenantConnection};
use crate::egress::{body_excerpt, EgressGateway};
use crate::error::{IntegrationError, Result};
use crate::oauth::exchange::{self, ClientCredentials};
use crate::oauth::{NonceCache, OAuthStatePayload, PlatformEndpoints, StateCodec};
use crate::tenant::{CompanyDirectory, CompanyRef, TenantResolver};
use crate::token::{AccessContext, TokenLifecycleManager};
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

#[cfg(test)]
mod tests;

/// Query parameters the provider appends to the redirect URI
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    #[serde(rename = "realmId")]
    pub realm_id: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Connection summary reported to the frontend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_expired: Option<bool>,
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            connected: false,
            expires_at: None,
            is_expired: None,
        }
    }
}

/// What a disconnect actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOutcome {
    pub tenant_id: i64,
    /// A row existed and was deleted
    pub removed: bool,
    /// The platform confirmed revocation
    pub revoked: bool,
}

struct Inner {
    store: Arc<ConnectionStore>,
    codec: SecretCodec,
    states: Option<StateCodec>,
    nonces: NonceCache,
    resolver: TenantResolver,
    gateway: Arc<EgressGateway>,
    endpoints: PlatformEndpoints,
    client: Option<ClientCredentials>,
    tokens: TokenLifecycleManager,
    redirect_uri: String,
    scope: String,
    minor_version: u32,
}

/// Per-tenant accounting connection operations.
#[derive(Clone)]
pub struct ConnectionService {
    inner: Arc<Inner>,
}

impl ConnectionService {
    /// Wires the service from configuration.
    ///
    /// Fails with `MissingKey`/`InvalidKey` when the encryption key is absent
    /// or malformed. A missing state signing secret (and client secret) is
    /// logged and only fails the OAuth flow itself.
    pub fn from_config(
        config: &IntegrationConfig,
        store: Arc<ConnectionStore>,
        directory: Arc<CompanyDirectory>,
        gateway: Arc<EgressGateway>,
    ) -> Result<Self> {
        let codec = SecretCodec::from_key(config.security.encryption_key.as_deref())?;

        let states = match StateCodec::from_config(
            config.security.state_signing_secret.as_deref(),
            config.oauth.client_secret.as_deref(),
            config.security.state_ttl_seconds,
        ) {
            Ok(codec) => Some(codec),
            Err(e) => {
                error!(error = %e, "OAuth state signing is not configured, connect flow disabled");
                None
            }
        };

        let client = ClientCredentials::from_config(
            config.oauth.client_id.as_deref(),
            config.oauth.client_secret.as_deref(),
        );
        if client.is_none() {
            error!("OAuth client id/secret not configured, connect and refresh will fail");
        }

        let endpoints = config.platform_endpoints();
        let tokens = TokenLifecycleManager::new(
            Arc::clone(&store),
            codec.clone(),
            Arc::clone(&gateway),
            endpoints.clone(),
            client.clone(),
            Duration::seconds(config.token.refresh_buffer_seconds),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                resolver: TenantResolver::new(directory, Arc::clone(&store)),
                store,
                codec,
                nonces: NonceCache::new(Duration::seconds(config.security.state_ttl_seconds)),
                states,
                gateway,
                endpoints,
                client,
                tokens,
                redirect_uri: config.oauth.redirect_uri.clone(),
                scope: config.oauth.scope.clone(),
                minor_version: config.platform.minor_version,
            }),
        })
    }

    /// Consumed-nonce cache, for the periodic cleanup task.
    pub fn nonces(&self) -> NonceCache {
        self.inner.nonces.clone()
    }

    fn client(&self) -> Result<&ClientCredentials> {
        self.inner.client.as_ref().ok_or_else(|| {
            error!("OAuth client credentials are not configured");
            IntegrationError::MissingClientCredentials
        })
    }

    fn states(&self) -> Result<&StateCodec> {
        self.inner.states.as_ref().ok_or_else(|| {
            error!("OAuth state signing secret is not configured");
            IntegrationError::MissingKey
        })
    }

    /// Builds the provider authorization URL for the resolved tenant.
    pub fn authorize(&self, company: &CompanyRef) -> Result<String> {
        let tenant_id = self.inner.resolver.resolve_required(company)?;
        let client = self.client()?;
        let state = self.states()?.encode(&OAuthStatePayload::new(tenant_id))?;

        info!(tenant_id, "Starting accounting connect flow");

        Ok(self.inner.endpoints.build_auth_url(
            &client.client_id,
            &self.inner.scope,
            &self.inner.redirect_uri,
            &state,
        ))
    }

    /// Completes the authorization code flow and stores the connection.
    ///
    /// Returns the tenant the connection was stored under.
    pub async fn callback(&self, params: CallbackParams) -> Result<i64> {
        if let Some(reason) = params.error {
            warn!(reason = %reason, "Provider returned an authorization error");
            return Err(IntegrationError::AuthorizationDenied(reason));
        }

        let code = params
            .code
            .ok_or(IntegrationError::MissingCallbackParameter("code"))?;
        let realm_id = params
            .realm_id
            .ok_or(IntegrationError::MissingCallbackParameter("realmId"))?;
        let state = params
            .state
            .ok_or(IntegrationError::MissingCallbackParameter("state"))?;

        let states = self.states()?;
        let payload = states.decode(&state).map_err(|e| {
            warn!(error = %e, "Rejected OAuth callback state");
            e
        })?;
        states.check_window(&payload, Utc::now()).map_err(|e| {
            warn!(tenant_id = payload.tenant_id, error = %e, "OAuth state outside validity window");
            e
        })?;

        let issued_at = payload.issued_at().ok_or(IntegrationError::StateExpired)?;
        if !self.inner.nonces.consume(&payload.nonce, issued_at) {
            warn!(tenant_id = payload.tenant_id, "Replayed OAuth state rejected");
            return Err(IntegrationError::StateReplayed);
        }

        let tenant_id = self
            .inner
            .resolver
            .resolve_required(&CompanyRef::Inferred(payload.tenant_id))?;
        let client = self.client()?;

        let grant = exchange::exchange_code(
            &self.inner.gateway,
            &self.inner.endpoints,
            client,
            &code,
            &self.inner.redirect_uri,
        )
        .await
        .map_err(|e| {
            warn!(tenant_id, error = %e, "Authorization code exchange failed");
            e
        })?;

        let codec = &self.inner.codec;
        let expires_at = grant
            .expires_at(Utc::now())
            .ok_or_else(|| IntegrationError::ExchangeFailed(exchange::INVALID_LIFETIME.to_string()))?;
        let connection = TenantConnection {
            tenant_id,
            realm_id: codec.encrypt(&realm_id)?,
            access_token: codec.encrypt(&grant.access_token)?,
            refresh_token: codec.encrypt(&grant.refresh_token)?,
            expires_at,
        };
        self.inner.store.upsert(&connection)?;

        info!(tenant_id, expires_at = %expires_at, "Accounting connection established");
        Ok(tenant_id)
    }

    /// Removes the tenant's connection, revoking the refresh token first.
    ///
    /// Idempotent. Revocation is best-effort; the row is deleted even when
    /// the platform cannot be reached.
    pub async fn disconnect(&self, company: &CompanyRef) -> Result<DisconnectOutcome> {
        let tenant_id = self.inner.resolver.resolve_required(company)?;

        let Some(connection) = self.inner.store.get(tenant_id)? else {
            info!(tenant_id, "Disconnect requested for tenant with no connection");
            return Ok(DisconnectOutcome {
                tenant_id,
                removed: false,
                revoked: false,
            });
        };

        let revoked = self.revoke_quietly(tenant_id, &connection).await;
        let removed = self.inner.store.delete(tenant_id)?;

        info!(tenant_id, revoked, "Accounting connection removed");
        Ok(DisconnectOutcome {
            tenant_id,
            removed,
            revoked,
        })
    }

    async fn revoke_quietly(&self, tenant_id: i64, connection: &TenantConnection) -> bool {
        let Some(client) = self.inner.client.as_ref() else {
            warn!(tenant_id, "Skipping token revocation, client credentials not configured");
            return false;
        };

        let refresh_token = match self.inner.codec.decrypt(&connection.refresh_token) {
            Ok(token) => token,
            Err(e) => {
                warn!(tenant_id, error = %e, "Skipping token revocation, stored token unreadable");
                return false;
            }
        };

        match exchange::revoke(
            &self.inner.gateway,
            &self.inner.endpoints,
            client,
            &refresh_token,
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(tenant_id, error = %e, "Token revocation failed, deleting connection anyway");
                false
            }
        }
    }

    /// Reports whether the tenant is connected, refreshing an expiring token.
    pub async fn status(&self, company: &CompanyRef) -> Result<ConnectionStatus> {
        let tenant_id = self.inner.resolver.resolve_required(company)?;

        let Some(connection) = self.inner.store.get(tenant_id)? else {
            return Ok(ConnectionStatus::disconnected());
        };

        let context = self
            .inner
            .tokens
            .ensure_fresh_access(&connection, tenant_id)
            .await?;

        Ok(ConnectionStatus {
            connected: true,
            expires_at: Some(context.expires_at()),
            is_expired: Some(context.expires_at() <= Utc::now()),
        })
    }

    /// Fresh credentials for calling the platform on the tenant's behalf.
    pub async fn access(&self, company: &CompanyRef) -> Result<AccessContext> {
        let tenant_id = self.inner.resolver.resolve_required(company)?;
        let connection = self
            .inner
            .store
            .get(tenant_id)?
            .ok_or(IntegrationError::NotConnected(tenant_id))?;

        self.inner
            .tokens
            .ensure_fresh_access(&connection, tenant_id)
            .await
    }

    /// Authenticated GET against `v3/company/<realm>/<path>`.
    pub async fn platform_get(&self, company: &CompanyRef, path: &str) -> Result<serde_json::Value> {
        let context = self.access(company).await?;

        let path = path.trim_start_matches('/');
        let separator = if path.contains('?') { '&' } else { '?' };
        let target = format!(
            "{}v3/company/{}/{}{}minorversion={}",
            base_with_slash(&self.inner.endpoints.api_base_url),
            urlencoding::encode(context.realm_id()),
            path,
            separator,
            self.inner.minor_version
        );

        let response = self
            .inner
            .gateway
            .send(Method::GET, &target, |r| {
                r.bearer_auth(context.access_token())
                    .header("Accept", "application/json")
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = body_excerpt(response).await;
            warn!(status = status.as_u16(), body = %body, "Platform API call rejected");
            return Err(IntegrationError::Platform {
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(|e| {
            warn!(error = %e, "Platform API returned unparseable body");
            IntegrationError::Platform {
                status: status.as_u16(),
            }
        })
    }
}

fn base_with_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    }
}
