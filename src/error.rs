//! Error taxonomy for the accounting integration.
//!
//! Every failure that can cross a module boundary is an [`IntegrationError`].
//! Handlers never forward provider bodies or internal details to clients;
//! they use [`IntegrationError::public_reason`] instead.

use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T, E = IntegrationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IntegrationError {
    /// No encryption or signing key configured
    #[error("encryption key is not configured")]
    MissingKey,

    /// Key present but not a base64 32-byte key
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Refresh or exchange attempted without client id/secret
    #[error("OAuth client credentials are not configured")]
    MissingClientCredentials,

    #[error("malformed OAuth state")]
    MalformedState,

    #[error("OAuth state signature verification failed")]
    StateVerification,

    #[error("OAuth state payload is invalid: {0}")]
    InvalidStatePayload(String),

    #[error("OAuth state has expired")]
    StateExpired,

    #[error("OAuth state has already been used")]
    StateReplayed,

    /// Outbound call targeted a host outside the egress allow-list
    #[error("outbound host not allowed: {host}")]
    HostNotAllowed { host: String },

    /// The platform rejected a refresh attempt (or it never reached it)
    #[error("token refresh failed: {reason}")]
    RefreshFailed { status: Option<u16>, reason: String },

    #[error("authorization denied by provider: {0}")]
    AuthorizationDenied(String),

    #[error("callback is missing the '{0}' parameter")]
    MissingCallbackParameter(&'static str),

    #[error("company context could not be resolved: {0}")]
    TenantResolution(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("tenant {0} has no accounting connection")]
    NotConnected(i64),

    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("platform API returned status {status}")]
    Platform { status: u16 },

    #[error("outbound request failed: {0}")]
    Transport(String),

    #[error("credential decryption failed: {0}")]
    Crypto(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl IntegrationError {
    /// HTTP status the API layer reports for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedState
            | Self::StateVerification
            | Self::InvalidStatePayload(_)
            | Self::StateExpired
            | Self::StateReplayed
            | Self::AuthorizationDenied(_)
            | Self::MissingCallbackParameter(_)
            | Self::TenantResolution(_) => StatusCode::BAD_REQUEST,
            Self::RefreshFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotConnected(_) => StatusCode::NOT_FOUND,
            Self::ExchangeFailed(_) | Self::Platform { .. } | Self::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::MissingKey
            | Self::InvalidKey(_)
            | Self::MissingClientCredentials
            | Self::HostNotAllowed { .. }
            | Self::Crypto(_)
            | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic, client-safe description. Never contains provider bodies,
    /// hostnames or secret material.
    pub fn public_reason(&self) -> &'static str {
        match self {
            Self::MalformedState
            | Self::StateVerification
            | Self::InvalidStatePayload(_)
            | Self::StateExpired
            | Self::StateReplayed => "invalid_state",
            Self::RefreshFailed { .. } => "reconnect_required",
            Self::AuthorizationDenied(_) => "authorization_denied",
            Self::MissingCallbackParameter(_) => "missing_parameters",
            Self::TenantResolution(_) => "missing_company",
            Self::Forbidden(_) => "forbidden",
            Self::NotConnected(_) => "not_connected",
            Self::ExchangeFailed(_) => "token_exchange_failed",
            Self::Platform { .. } | Self::Transport(_) => "platform_unavailable",
            Self::MissingKey
            | Self::InvalidKey(_)
            | Self::MissingClientCredentials
            | Self::HostNotAllowed { .. } => "integration_misconfigured",
            Self::Crypto(_) | Self::Storage(_) => "internal_error",
        }
    }

    /// True for deployment misconfiguration that operators must fix.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::MissingKey
                | Self::InvalidKey(_)
                | Self::MissingClientCredentials
                | Self::HostNotAllowed { .. }
        )
    }
}
