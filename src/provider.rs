//! The video call provider: rooms, meeting tokens and live presence.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use time::OffsetDateTime;

use crate::ids::{CallType, UserId};
use crate::roomname::RoomName;

pub const DEFAULT_API_URL: &str = "https://api.daily.co/v1";

const ROOM_LIFETIME_SECS: i64 = 60 * 60;
const DEFAULT_MAX_PARTICIPANTS: u32 = 20;
const BROADCAST_MAX_PARTICIPANTS: u32 = 200;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider API error ({status}): {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    #[serde(default)]
    pub config: RoomConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomConfig {
    #[serde(default)]
    pub enable_hidden_participants: bool,
}

impl RoomInfo {
    /// Broadcast rooms are the ones created with hidden participants.
    pub fn call_type(&self) -> CallType {
        if self.config.enable_hidden_participants {
            CallType::Broadcast
        } else {
            CallType::Default
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeetingTokenRequest<'a> {
    pub room_name: &'a RoomName,
    pub user_id: UserId,
    pub username: &'a str,
    pub joining: bool,
    pub call_type: CallType,
}

#[async_trait]
pub trait VideoProvider: Send + Sync + 'static {
    /// Names of every room with at least one live participant.
    async fn presence(&self) -> Result<HashSet<RoomName>, ProviderError>;

    async fn get_room(&self, room_name: &RoomName) -> Result<Option<RoomInfo>, ProviderError>;

    async fn create_room(&self, room_name: &RoomName, call_type: CallType) -> Result<RoomInfo, ProviderError>;

    /// Deleting a room that is already gone succeeds.
    async fn delete_room(&self, room_name: &RoomName) -> Result<(), ProviderError>;

    async fn meeting_token(&self, request: &MeetingTokenRequest<'_>) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct DailyClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl DailyClient {
    pub fn new(api_key: impl Into<String>, base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.as_ref().trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.api_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.api_key)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::Api { status, body })
        }
    }
}

#[async_trait]
impl VideoProvider for DailyClient {
    async fn presence(&self) -> Result<HashSet<RoomName>, ProviderError> {
        let response = Self::ensure_success(self.get("/presence").send().await?).await?;
        let rooms: HashMap<String, JsonValue> = response.json().await?;
        tracing::debug!(occupied = rooms.len(), "global presence fetched");
        Ok(rooms.into_keys().map(RoomName::from).collect())
    }

    async fn get_room(&self, room_name: &RoomName) -> Result<Option<RoomInfo>, ProviderError> {
        let response = self.get(&format!("/rooms/{room_name}")).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::ensure_success(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn create_room(&self, room_name: &RoomName, call_type: CallType) -> Result<RoomInfo, ProviderError> {
        let params = room_params(room_name, call_type, OffsetDateTime::now_utc().unix_timestamp());
        tracing::debug!(room = %room_name, ?call_type, "creating provider room");

        let response = self.post("/rooms").json(&params).send().await?;
        let response = Self::ensure_success(response).await.inspect_err(|err| {
            tracing::error!(room = %room_name, error = %err, "unable to create provider room");
        })?;
        Ok(response.json().await?)
    }

    async fn delete_room(&self, room_name: &RoomName) -> Result<(), ProviderError> {
        tracing::debug!(room = %room_name, "deleting provider room");
        let response = self
            .http
            .delete(self.url(&format!("/rooms/{room_name}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn meeting_token(&self, request: &MeetingTokenRequest<'_>) -> Result<String, ProviderError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let response = self.post("/meeting-tokens").json(&token_params(request)).send().await?;
        let response = Self::ensure_success(response).await.inspect_err(|err| {
            tracing::error!(room = %request.room_name, error = %err, "unable to issue meeting token");
        })?;
        let TokenResponse { token } = response.json().await?;
        Ok(token)
    }
}

fn room_params(room_name: &RoomName, call_type: CallType, now: i64) -> JsonValue {
    let mut params = json!({
        "name": room_name.as_str(),
        "privacy": "private",
        "properties": {
            "nbf": now,
            "exp": now + ROOM_LIFETIME_SECS,
            "enable_people_ui": false,
            "enable_pip_ui": true,
            "enable_emoji_reactions": false,
            "enable_hand_raising": false,
            "enable_prejoin_ui": false,
            "enable_network_ui": false,
            "enable_noise_cancellation_ui": true,
            "enable_breakout_rooms": false,
            "enable_knocking": false,
            "enable_screenshare": true,
            "eject_at_room_exp": true,
            "max_participants": DEFAULT_MAX_PARTICIPANTS,
            "permissions": {
                "hasPresence": true,
                "canSend": true,
                "canAdmin": false
            }
        }
    });

    if call_type == CallType::Broadcast {
        let properties = &mut params["properties"];
        properties["max_participants"] = json!(BROADCAST_MAX_PARTICIPANTS);
        properties["enable_mesh_sfu"] = json!(true);
        properties["enable_terse_logging"] = json!(true);
        properties["enable_hidden_participants"] = json!(true);
        properties["owner_only_broadcast"] = json!(false);
        properties["experimental_optimize_large_calls"] = json!(true);
    }
    params
}

fn token_params(request: &MeetingTokenRequest<'_>) -> JsonValue {
    let owner = !request.joining;
    let mut params = json!({
        "properties": {
            "room_name": request.room_name.as_str(),
            "user_name": request.username,
            "user_id": request.user_id.to_string(),
            "is_owner": owner,
            "permissions": {
                "canSend": true,
                "hasPresence": true,
                "canAdmin": owner
            }
        }
    });

    // broadcast audiences join muted and invisible
    if request.call_type == CallType::Broadcast {
        let properties = &mut params["properties"];
        properties["start_video_off"] = json!(request.joining);
        properties["start_audio_off"] = json!(request.joining);
        properties["permissions"] = json!({
            "canSend": owner,
            "hasPresence": owner,
            "canAdmin": owner
        });
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        "dfdal-2uaaa-aaaaa-qaama-cai".parse().unwrap()
    }

    #[test]
    fn default_room_params() {
        let params = room_params(&RoomName::from("GgAAAAAAQABYBAQ"), CallType::Default, 1_000);
        assert_eq!(params["name"], "GgAAAAAAQABYBAQ");
        assert_eq!(params["privacy"], "private");
        assert_eq!(params["properties"]["nbf"], 1_000);
        assert_eq!(params["properties"]["exp"], 1_000 + ROOM_LIFETIME_SECS);
        assert_eq!(params["properties"]["max_participants"], 20);
        assert!(params["properties"].get("enable_hidden_participants").is_none());
    }

    #[test]
    fn broadcast_room_params() {
        let params = room_params(&RoomName::from("GgAAAAAAQABYBAQ"), CallType::Broadcast, 1_000);
        assert_eq!(params["properties"]["max_participants"], 200);
        assert_eq!(params["properties"]["enable_hidden_participants"], true);
        assert_eq!(params["properties"]["eject_at_room_exp"], true);
    }

    #[test]
    fn call_type_follows_hidden_participants() {
        let room: RoomInfo =
            serde_json::from_value(json!({"name": "G", "config": {"enable_hidden_participants": true}})).unwrap();
        assert_eq!(room.call_type(), CallType::Broadcast);
        let room: RoomInfo = serde_json::from_value(json!({"name": "G", "config": {}})).unwrap();
        assert_eq!(room.call_type(), CallType::Default);
        let room: RoomInfo = serde_json::from_value(json!({"name": "G"})).unwrap();
        assert_eq!(room.call_type(), CallType::Default);
    }

    #[test]
    fn starter_token_is_owner() {
        let room = RoomName::from("GgAAAAAAQABYBAQ");
        let params = token_params(&MeetingTokenRequest {
            room_name: &room,
            user_id: user(),
            username: "alice",
            joining: false,
            call_type: CallType::Default,
        });
        assert_eq!(params["properties"]["is_owner"], true);
        assert_eq!(params["properties"]["permissions"]["canAdmin"], true);
        assert_eq!(params["properties"]["user_id"], "dfdal-2uaaa-aaaaa-qaama-cai");
    }

    #[test]
    fn broadcast_joiner_token_is_muted_and_hidden() {
        let room = RoomName::from("GgAAAAAAQABYBAQ");
        let params = token_params(&MeetingTokenRequest {
            room_name: &room,
            user_id: user(),
            username: "bob",
            joining: true,
            call_type: CallType::Broadcast,
        });
        assert_eq!(params["properties"]["is_owner"], false);
        assert_eq!(params["properties"]["start_audio_off"], true);
        assert_eq!(params["properties"]["start_video_off"], true);
        assert_eq!(params["properties"]["permissions"]["canSend"], false);
        assert_eq!(params["properties"]["permissions"]["hasPresence"], false);
    }

    #[tokio::test]
    async fn silent_provider_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = DailyClient::new("key", format!("http://{addr}/"), Duration::from_millis(100)).unwrap();
        assert_eq!(client.url("/presence"), format!("http://{addr}/presence"));

        let started = std::time::Instant::now();
        match client.presence().await {
            Err(ProviderError::Http(err)) => assert!(err.is_timeout(), "{err}"),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
