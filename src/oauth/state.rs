//! Signed OAuth `state` parameter.
//!
//! The state carries `{tenantId, nonce, issuedAt}` through the provider
//! redirect as `<data>.<signature>`, where `data` is base64url JSON and
//! `signature` is base64url HMAC-SHA256 over the `data` bytes. Verification
//! is stateless, so the callback may land on any instance.

use crate::error::{IntegrationError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew for `issuedAt` values in the future
const MAX_FUTURE_SKEW_SECONDS: i64 = 60;

/// Domain separator for secrets derived from the client secret
const DERIVATION_CONTEXT: &[u8] = b"ledgerlink/oauth-state/";

/// Payload signed into the state parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthStatePayload {
    pub tenant_id: i64,
    pub nonce: String,
    /// Unix milliseconds
    pub issued_at: i64,
}

impl OAuthStatePayload {
    /// New payload for `tenant_id` with a random 128-bit nonce.
    pub fn new(tenant_id: i64) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            tenant_id,
            nonce: URL_SAFE_NO_PAD.encode(bytes),
            issued_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.issued_at)
    }
}

/// Lenient wire form used to report precise payload errors.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    tenant_id: Option<Value>,
    nonce: Option<String>,
    issued_at: Option<i64>,
}

/// Signs and verifies state parameters.
#[derive(Clone)]
pub struct StateCodec {
    secret: Zeroizing<Vec<u8>>,
    ttl: Duration,
}

impl StateCodec {
    /// Codec with an explicit signing secret.
    pub fn new(secret: &[u8], ttl_seconds: i64) -> Self {
        Self {
            secret: Zeroizing::new(secret.to_vec()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Uses the configured signing secret, falling back to one derived from
    /// the client secret. Fails with `MissingKey` when neither is set.
    pub fn from_config(
        signing_secret: Option<&str>,
        client_secret: Option<&str>,
        ttl_seconds: i64,
    ) -> Result<Self> {
        if let Some(secret) = signing_secret.filter(|s| !s.is_empty()) {
            return Ok(Self::new(secret.as_bytes(), ttl_seconds));
        }

        let client_secret = client_secret
            .filter(|s| !s.is_empty())
            .ok_or(IntegrationError::MissingKey)?;
        tracing::warn!("No state signing secret configured, deriving one from the client secret");

        let mut hasher = Sha256::new();
        hasher.update(DERIVATION_CONTEXT);
        hasher.update(client_secret.as_bytes());
        Ok(Self::new(&hasher.finalize(), ttl_seconds))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| IntegrationError::InvalidKey(format!("state signing key: {}", e)))
    }

    /// Serializes and signs a payload.
    pub fn encode(&self, payload: &OAuthStatePayload) -> Result<String> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| IntegrationError::InvalidStatePayload(e.to_string()))?;
        let data = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(data.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", data, signature))
    }

    /// Verifies the signature and parses the payload.
    ///
    /// Does not check the validity window; see [`StateCodec::check_window`].
    pub fn decode(&self, state: &str) -> Result<OAuthStatePayload> {
        let (data, signature) = state
            .split_once('.')
            .filter(|(d, s)| !d.is_empty() && !s.is_empty())
            .ok_or(IntegrationError::MalformedState)?;

        let signature =
            URL_SAFE_NO_PAD.decode(signature).map_err(|_| IntegrationError::StateVerification)?;

        let mut mac = self.mac()?;
        mac.update(data.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| IntegrationError::StateVerification)?;

        let json = URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|_| IntegrationError::InvalidStatePayload("data is not base64url".into()))?;
        let raw: RawPayload = serde_json::from_slice(&json)
            .map_err(|e| IntegrationError::InvalidStatePayload(e.to_string()))?;

        let tenant_id = raw
            .tenant_id
            .as_ref()
            .and_then(coerce_tenant_id)
            .ok_or_else(|| IntegrationError::InvalidStatePayload("missing tenantId".into()))?;

        Ok(OAuthStatePayload {
            tenant_id,
            nonce: raw.nonce.unwrap_or_default(),
            issued_at: raw.issued_at.unwrap_or_default(),
        })
    }

    /// Rejects payloads issued too long ago or too far in the future.
    pub fn check_window(&self, payload: &OAuthStatePayload, now: DateTime<Utc>) -> Result<()> {
        let issued_at = payload.issued_at().ok_or(IntegrationError::StateExpired)?;
        if now - issued_at > self.ttl {
            return Err(IntegrationError::StateExpired);
        }
        if issued_at - now > Duration::seconds(MAX_FUTURE_SKEW_SECONDS) {
            return Err(IntegrationError::StateExpired);
        }
        Ok(())
    }
}

/// Accepts integers and integer strings, matching how company ids arrive
/// from older clients.
fn coerce_tenant_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
