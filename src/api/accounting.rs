//! Accounting integration endpoints.
//!
//! All routes live under `/api/integrations/accounting`:
//! - `GET  /authorize`  start the connect flow (302, or `{url}` with `format=json`)
//! - `GET  /callback`   provider redirect target, ends on the frontend
//! - `GET  /status`     connection summary, refreshing an expiring token
//! - `POST /disconnect` revoke and forget the tenant's connection
//! - `GET  /health`

use super::error::AppError;
use super::redirect::FrontendRedirect;
use crate::auth::{CallerIdentity, CallerRegistry};
use crate::connection::{CallbackParams, ConnectionService};
use crate::error::IntegrationError;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared application state for the accounting API
#[derive(Clone)]
pub struct AccountingAppState {
    pub connections: ConnectionService,
    pub callers: CallerRegistry,
    pub auth_enabled: bool,
    pub frontend: FrontendRedirect,
}

impl AccountingAppState {
    /// Identifies the caller from the bearer key, or the session header
    /// when authentication is disabled.
    fn caller(&self, headers: &HeaderMap) -> Result<CallerIdentity, AppError> {
        if !self.auth_enabled {
            return Ok(CallerIdentity::from_session_header(headers));
        }
        self.callers.authenticate(headers).map_err(|e| {
            warn!(error = %e, "Rejected accounting API request");
            AppError::from(e)
        })
    }
}

/// Optional cross-company override
#[derive(Debug, Default, Deserialize)]
pub struct CompanyQuery {
    #[serde(rename = "companyId")]
    company_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeQuery {
    #[serde(rename = "companyId")]
    company_id: Option<String>,
    format: Option<String>,
}

#[derive(Serialize)]
struct AuthorizeResponse {
    url: String,
}

/// Create accounting API router
pub fn create_accounting_router(state: AccountingAppState) -> Router {
    Router::new()
        .route("/api/integrations/accounting/authorize", get(authorize))
        .route("/api/integrations/accounting/callback", get(callback))
        .route("/api/integrations/accounting/status", get(status))
        .route("/api/integrations/accounting/disconnect", post(disconnect))
        .route("/api/integrations/accounting/health", get(health))
        .with_state(Arc::new(state))
}

/// 302 Found, which is what browsers and the provider expect here.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// GET /api/integrations/accounting/authorize
async fn authorize(
    State(state): State<Arc<AccountingAppState>>,
    Query(query): Query<AuthorizeQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = state.caller(&headers)?;
    let company = caller.company_ref(query.company_id.as_deref())?;
    let as_json = query.format.as_deref() == Some("json");

    debug!(company = ?company, as_json, "Authorize requested");

    match state.connections.authorize(&company) {
        Ok(url) if as_json => Ok(Json(AuthorizeResponse { url }).into_response()),
        Ok(url) => Ok(found(&url)),
        Err(e) if as_json => Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Authorize failed, returning to frontend");
            Ok(found(&state.frontend.error_url(e.public_reason())))
        }
    }
}

/// GET /api/integrations/accounting/callback
///
/// Always ends in a redirect to the frontend; failures carry only a generic
/// reason.
async fn callback(
    State(state): State<Arc<AccountingAppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.connections.callback(params).await {
        Ok(tenant_id) => {
            info!(tenant_id, "Accounting callback completed");
            found(&state.frontend.success_url())
        }
        Err(e) => {
            warn!(error = %e, "Accounting callback failed");
            found(&state.frontend.error_url(e.public_reason()))
        }
    }
}

/// GET /api/integrations/accounting/status
async fn status(
    State(state): State<Arc<AccountingAppState>>,
    Query(query): Query<CompanyQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = state.caller(&headers)?;
    let company = caller.company_ref(query.company_id.as_deref())?;

    match state.connections.status(&company).await {
        Ok(status) => Ok(Json(status).into_response()),
        Err(e @ IntegrationError::RefreshFailed { .. }) => Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "connected": false,
                "isExpired": true,
                "error": e.public_reason(),
            })),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

/// POST /api/integrations/accounting/disconnect
async fn disconnect(
    State(state): State<Arc<AccountingAppState>>,
    Query(query): Query<CompanyQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = state.caller(&headers)?;
    let company = caller.company_ref(query.company_id.as_deref())?;

    let outcome = state.connections.disconnect(&company).await?;
    debug!(
        tenant_id = outcome.tenant_id,
        removed = outcome.removed,
        revoked = outcome.revoked,
        "Disconnect handled"
    );

    Ok(Json(json!({ "success": true })))
}

/// GET /api/integrations/accounting/health
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
