//! Tenant resolution.
//!
//! A company identifier reaches us in one of several shapes: a query
//! parameter override, the caller's session, or the id signed into the OAuth
//! state. [`CompanyRef`] records which one was used, once, at the request
//! boundary; [`TenantResolver`] turns it into the tenant id that owns the
//! connection row.

use crate::credentials::ConnectionStore;
use crate::error::{IntegrationError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

mod store;

pub use store::CompanyDirectory;

/// Where a company identifier came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompanyRef {
    /// Explicit cross-company override (query parameter)
    Explicit(i64),
    /// Taken from the caller's session or the signed OAuth state
    Inferred(i64),
    /// No integer-coercible identifier available
    Missing,
}

impl CompanyRef {
    /// Builds the reference from the raw request inputs.
    ///
    /// An override wins over the session; values that are not positive
    /// integers are treated as absent.
    pub fn from_sources(override_id: Option<&str>, session_id: Option<&str>) -> Self {
        if let Some(id) = override_id.and_then(coerce_company_id) {
            return CompanyRef::Explicit(id);
        }
        if let Some(id) = session_id.and_then(coerce_company_id) {
            return CompanyRef::Inferred(id);
        }
        CompanyRef::Missing
    }

    pub fn id(&self) -> Option<i64> {
        match *self {
            CompanyRef::Explicit(id) | CompanyRef::Inferred(id) => Some(id),
            CompanyRef::Missing => None,
        }
    }
}

/// Parses a company id the way legacy clients send it (`"12"`, `" 12 "`).
pub fn coerce_company_id(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Maps company identifiers to the tenant that owns credentials.
#[derive(Clone)]
pub struct TenantResolver {
    directory: Arc<CompanyDirectory>,
    connections: Arc<ConnectionStore>,
}

impl TenantResolver {
    pub fn new(directory: Arc<CompanyDirectory>, connections: Arc<ConnectionStore>) -> Self {
        Self {
            directory,
            connections,
        }
    }

    /// Resolves the canonical tenant id, or `None` when no company context
    /// exists.
    ///
    /// If the supplied id already owns a connection row it is preferred over
    /// the canonical mapping, which keeps tenants connected before an alias
    /// was introduced working. Lookup failures never propagate.
    pub fn resolve(&self, company: &CompanyRef) -> Option<i64> {
        let supplied = company.id()?;

        let canonical = match self.directory.canonical_id(supplied) {
            Ok(id) => id,
            Err(e) => {
                warn!(company_id = supplied, error = %e, "Alias lookup failed, using supplied id");
                supplied
            }
        };

        if canonical != supplied {
            match self.connections.exists(supplied) {
                Ok(true) => {
                    debug!(
                        company_id = supplied,
                        canonical_id = canonical,
                        "Supplied id owns a connection, preferring it over canonical"
                    );
                    return Some(supplied);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(company_id = supplied, error = %e, "Connection existence check failed");
                }
            }
        }

        Some(canonical)
    }

    /// Like [`TenantResolver::resolve`], failing with `TenantResolution`.
    pub fn resolve_required(&self, company: &CompanyRef) -> Result<i64> {
        self.resolve(company).ok_or_else(|| {
            IntegrationError::TenantResolution("no company identifier supplied".to_string())
        })
    }
}
