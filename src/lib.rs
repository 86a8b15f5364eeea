pub mod api;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod ids;
pub mod lifecycle;
pub mod provider;
pub mod reconcile;
pub mod roomname;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};

use auth::{AuthError, TokenVerifier, WebhookVerifier};
use lifecycle::{MeetingError, MeetingService};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub meetings: Arc<MeetingService>,
    pub tokens: Arc<TokenVerifier>,
    pub webhooks: Arc<WebhookVerifier>,
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        if let Some(err) = self.0.downcast_ref::<MeetingError>() {
            return match err {
                MeetingError::NoMeetingInProgress(_) => StatusCode::NOT_FOUND,
                MeetingError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                MeetingError::Provider(_) | MeetingError::Dispatch(_) => StatusCode::BAD_GATEWAY,
                MeetingError::RoomName(_) | MeetingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if self.0.downcast_ref::<AuthError>().is_some() {
            return StatusCode::UNAUTHORIZED;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
