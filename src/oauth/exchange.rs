//! Token endpoint grants and revocation.
//!
//! All requests authenticate the client with HTTP Basic auth and go through
//! the [`EgressGateway`].

use crate::egress::{body_excerpt, EgressGateway};
use crate::error::{IntegrationError, Result};
use crate::oauth::provider::PlatformEndpoints;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Method;
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// OAuth client id and secret
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
}

impl ClientCredentials {
    /// Both values must be present and non-empty.
    pub fn from_config(client_id: Option<&str>, client_secret: Option<&str>) -> Option<Self> {
        match (client_id, client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some(Self {
                client_id: id.to_string(),
                client_secret: Zeroizing::new(secret.to_string()),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Token endpoint response.
///
/// The platform rotates refresh tokens on every use; the returned refresh
/// token replaces the previous one, which is invalid from now on.
#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub x_refresh_token_expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenGrant {
    /// Absolute access token expiry, or `None` when the lifetime is not
    /// positive or does not fit a timestamp.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.expires_in <= 0 {
            return None;
        }
        TimeDelta::try_seconds(self.expires_in).and_then(|lifetime| now.checked_add_signed(lifetime))
    }
}

/// OAuth error body (`{"error": "invalid_grant"}`)
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Reason reported for a grant whose `expires_in` cannot be used
pub const INVALID_LIFETIME: &str = "invalid token lifetime";

/// Why a grant did not produce tokens
enum GrantFailure {
    /// Gateway refused the call; propagate unchanged
    Blocked(IntegrationError),
    /// Network failure or provider rejection
    Rejected { status: Option<u16>, reason: String },
}

async fn request_grant(
    gateway: &EgressGateway,
    token_url: &str,
    client: &ClientCredentials,
    form: &[(&str, &str)],
) -> std::result::Result<TokenGrant, GrantFailure> {
    let response = gateway
        .send(Method::POST, token_url, |r| {
            r.basic_auth(&client.client_id, Some(client.client_secret.as_str()))
                .header("Accept", "application/json")
                .form(form)
        })
        .await
        .map_err(|e| match e {
            IntegrationError::Transport(reason) => GrantFailure::Rejected {
                status: None,
                reason,
            },
            other => GrantFailure::Blocked(other),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = body_excerpt(response).await;
        let reason = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("status {}", status.as_u16()));
        tracing::warn!(status = status.as_u16(), body = %body, "Token endpoint rejected grant");
        return Err(GrantFailure::Rejected {
            status: Some(status.as_u16()),
            reason,
        });
    }

    let grant = response
        .json::<TokenGrant>()
        .await
        .map_err(|_| GrantFailure::Rejected {
            status: Some(status.as_u16()),
            reason: "unparseable token response".to_string(),
        })?;

    if grant.expires_at(Utc::now()).is_none() {
        tracing::warn!(expires_in = grant.expires_in, "Token endpoint returned an unusable lifetime");
        return Err(GrantFailure::Rejected {
            status: Some(status.as_u16()),
            reason: INVALID_LIFETIME.to_string(),
        });
    }

    Ok(grant)
}

/// Exchange authorization code for tokens.
pub async fn exchange_code(
    gateway: &EgressGateway,
    endpoints: &PlatformEndpoints,
    client: &ClientCredentials,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenGrant> {
    tracing::debug!("Exchanging authorization code for tokens");

    request_grant(
        gateway,
        &endpoints.token_url,
        client,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ],
    )
    .await
    .map_err(|failure| match failure {
        GrantFailure::Blocked(e) => e,
        GrantFailure::Rejected { reason, .. } => IntegrationError::ExchangeFailed(reason),
    })
}

/// Trades a refresh token for a new access/refresh pair.
pub async fn refresh(
    gateway: &EgressGateway,
    endpoints: &PlatformEndpoints,
    client: &ClientCredentials,
    refresh_token: &str,
) -> Result<TokenGrant> {
    request_grant(
        gateway,
        &endpoints.token_url,
        client,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
    )
    .await
    .map_err(|failure| match failure {
        GrantFailure::Blocked(e) => e,
        GrantFailure::Rejected { status, reason } => {
            IntegrationError::RefreshFailed { status, reason }
        }
    })
}

/// Revokes a token at the platform.
pub async fn revoke(
    gateway: &EgressGateway,
    endpoints: &PlatformEndpoints,
    client: &ClientCredentials,
    token: &str,
) -> Result<()> {
    let response = gateway
        .send(Method::POST, &endpoints.revocation_url, |r| {
            r.basic_auth(&client.client_id, Some(client.client_secret.as_str()))
                .header("Accept", "application/json")
                .json(&serde_json::json!({ "token": token }))
        })
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = body_excerpt(response).await;
        tracing::warn!(status = status.as_u16(), body = %body, "Token revocation rejected");
        return Err(IntegrationError::Platform {
            status: status.as_u16(),
        });
    }

    Ok(())
}
