use crate::auth::TokenError;
use crate::error::IntegrationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
}

/// Application error for the accounting endpoints.
///
/// Bodies only ever carry [`IntegrationError::public_reason`].
pub enum AppError {
    Unauthorized(TokenError),
    Integration(IntegrationError),
}

impl From<IntegrationError> for AppError {
    fn from(err: IntegrationError) -> Self {
        AppError::Integration(err)
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        AppError::Unauthorized(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Integration(err) => {
                if err.status_code().is_server_error() {
                    error!(error = %err, "Accounting request failed");
                }
                (err.status_code(), err.public_reason())
            }
        };

        (status, Json(ErrorResponse { error: reason })).into_response()
    }
}
