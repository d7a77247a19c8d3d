//! Caller authentication.
//!
//! API callers present `Authorization: Bearer <api key>`. Keys map to a
//! [`CallerIdentity`] (home company plus admin flag) held in a
//! [`CallerRegistry`] seeded from configuration.

use crate::error::IntegrationError;
use crate::tenant::{coerce_company_id, CompanyRef};
use axum::http::HeaderMap;
use dashmap::DashMap;
use std::sync::Arc;


/// Header naming the session company when authentication is disabled
pub const COMPANY_HEADER: &str = "x-company-id";

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if !parts[0].eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    /// Token is empty string
    Empty,
    /// Well-formed but not a registered API key
    Unknown,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
            TokenError::Unknown => write!(f, "Authorization token not recognized"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Who is calling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Session company
    pub company_id: Option<i64>,
    /// Admins may act on other companies via `companyId`
    pub admin: bool,
}

impl CallerIdentity {
    /// Identity used when authentication is disabled: the session company
    /// comes from the `X-Company-Id` header and overrides are permitted.
    pub fn from_session_header(headers: &HeaderMap) -> Self {
        let company_id = headers
            .get(COMPANY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(coerce_company_id);
        Self {
            company_id,
            admin: true,
        }
    }

    /// Combines the session company with a `companyId` query override.
    ///
    /// Non-admins may only name their own company; anything else is
    /// `Forbidden`.
    pub fn company_ref(&self, override_param: Option<&str>) -> Result<CompanyRef, IntegrationError> {
        let session = self.company_id.map(|id| id.to_string());
        let company = CompanyRef::from_sources(override_param, session.as_deref());

        if let CompanyRef::Explicit(id) = company {
            if !self.admin && self.company_id != Some(id) {
                return Err(IntegrationError::Forbidden(format!(
                    "caller may not act on company {}",
                    id
                )));
            }
        }

        Ok(company)
    }
}

/// API key → caller identity
#[derive(Clone, Default)]
pub struct CallerRegistry {
    keys: Arc<DashMap<String, CallerIdentity>>,
}

impl CallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `token` for a caller. Replaces an existing entry.
    pub fn insert(&self, token: impl Into<String>, identity: CallerIdentity) {
        self.keys.insert(token.into(), identity);
    }

    pub fn lookup(&self, token: &str) -> Option<CallerIdentity> {
        self.keys.get(token).map(|entry| *entry.value())
    }

    /// Resolves the caller behind the request's bearer token.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<CallerIdentity, TokenError> {
        let token = extract_bearer_token(headers)?;
        self.lookup(&token).ok_or(TokenError::Unknown)
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }
}
