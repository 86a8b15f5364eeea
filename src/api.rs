//! HTTP surface of the bridge, nested under `/room`.

use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tower_http::cors::CorsLayer;

use crate::auth::{AccessClaims, AuthError, TokenVerifier, WEBHOOK_SIGNATURE_HEADER, WEBHOOK_TIMESTAMP_HEADER, WebhookVerifier};
use crate::ids::AvatarId;
use crate::lifecycle::{CallerProfile, MeetingError, MeetingService};
use crate::roomname::RoomName;
use crate::store::InProgressMeeting;
use crate::{AppResult, AppState};

pub const AUTH_HEADER: &str = "x-auth-jwt";

const MEETING_ENDED: &str = "meeting.ended";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/meetings", get(meetings))
        .route("/meeting_access_token", get(meeting_access_token))
        .route("/end_meeting", post(end_meeting))
        .route("/hook", post(hook))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/room", router())
        .with_state(state)
        .layer(CorsLayer::permissive())
}

fn access_claims(headers: &HeaderMap, tokens: &TokenVerifier) -> Result<AccessClaims, MeetingError> {
    let token = headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    Ok(tokens.verify(token)?)
}

/// What the bridge currently believes is in progress.
#[debug_handler(state = AppState)]
async fn meetings(State(meetings): State<Arc<MeetingService>>) -> AppResult<Json<Vec<InProgressMeeting>>> {
    Ok(Json(meetings.meetings().await?))
}

#[derive(Debug, Deserialize)]
struct AccessTokenQuery {
    username: String,
    displayname: Option<String>,
    avatarid: Option<String>,
}

#[debug_handler(state = AppState)]
async fn meeting_access_token(
    State(meetings): State<Arc<MeetingService>>,
    State(tokens): State<Arc<TokenVerifier>>,
    headers: HeaderMap,
    Query(AccessTokenQuery { username, displayname, avatarid }): Query<AccessTokenQuery>,
) -> AppResult<Response> {
    let claims = access_claims(&headers, &tokens)?;

    let avatar_id = match avatarid.as_deref().map(str::parse::<AvatarId>).transpose() {
        Ok(avatar_id) => avatar_id,
        Err(_) => return Ok((StatusCode::BAD_REQUEST, "avatarid must be a non-negative integer").into_response()),
    };
    let profile = CallerProfile { username, display_name: displayname, avatar_id };

    let grant = meetings.access_token(&claims, profile).await?;
    Ok(Json(grant).into_response())
}

#[debug_handler(state = AppState)]
async fn end_meeting(
    State(meetings): State<Arc<MeetingService>>,
    State(tokens): State<Arc<TokenVerifier>>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let claims = access_claims(&headers, &tokens)?;
    meetings.end_meeting(&claims).await?;
    Ok(StatusCode::OK)
}

/// Provider webhook. Always answers 200; anything unverifiable or
/// uninteresting is logged and dropped.
#[debug_handler(state = AppState)]
async fn hook(
    State(meetings): State<Arc<MeetingService>>,
    State(webhooks): State<Arc<WebhookVerifier>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event: JsonValue = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(error = %err, "hook body is not json");
            return StatusCode::OK;
        }
    };

    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingWebhookHeader(name))
    };
    let verified = header(WEBHOOK_TIMESTAMP_HEADER)
        .and_then(|timestamp| Ok((timestamp, header(WEBHOOK_SIGNATURE_HEADER)?)))
        .and_then(|(timestamp, signature)| webhooks.verify(timestamp, signature, &event));
    if let Err(err) = verified {
        tracing::debug!(error = %err, "hook does not pass validation");
        return StatusCode::OK;
    }

    let event_type = event["type"].as_str().unwrap_or_default();
    if event_type != MEETING_ENDED {
        tracing::debug!(event_type, "ignoring hook event");
        return StatusCode::OK;
    }
    let Some(room) = event["payload"]["room"].as_str() else {
        tracing::warn!("meeting ended event without a room");
        return StatusCode::OK;
    };

    let room_name = RoomName::from(room);
    tracing::debug!(room = %room_name, "meeting ended event received");
    tokio::spawn(async move {
        if let Err(err) = meetings.finish_room(&room_name).await {
            tracing::error!(room = %room_name, error = %err, "unable to finish meeting after hook");
        }
    });
    StatusCode::OK
}
