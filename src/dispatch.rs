//! Tells the messaging platform that calls started and ended.
//!
//! Every chat kind is served by its own backend canister: user canisters for
//! one-to-one chats, group canisters, and community canisters for channels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AvatarId, CallType, CanisterId, ChannelId, ChatId, CommunityId, GroupId, MessageId, UserId};
use crate::roomname::{DecodedRoom, RoomName, RoomNameError};
use crate::store::InProgressMeeting;

/// A backend canister that receives call notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    User(UserId),
    Group(GroupId),
    Community(CommunityId),
}

impl Recipient {
    pub fn canister_id(&self) -> CanisterId {
        match *self {
            Recipient::User(id) | Recipient::Group(id) | Recipient::Community(id) => id,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::User(id) => write!(f, "user {id}"),
            Recipient::Group(id) => write!(f, "group {id}"),
            Recipient::Community(id) => write!(f, "community {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartCallArgs {
    pub message_id: MessageId,
    pub initiator: UserId,
    pub initiator_username: String,
    pub initiator_display_name: Option<String>,
    pub initiator_avatar_id: Option<AvatarId>,
    pub call_type: CallType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndCallArgs {
    pub message_id: MessageId,
    /// For one-to-one chats, the other participant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StartCallOutcome {
    Success,
    NotAuthorized,
}

/// Every variant means the call is over as far as the backend is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EndCallOutcome {
    Success,
    AlreadyEnded,
    MessageNotFound,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("backend rejected the call ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn start_call(&self, recipient: Recipient, args: &StartCallArgs) -> Result<StartCallOutcome, BackendError>;

    async fn end_call(&self, recipient: Recipient, args: &EndCallArgs) -> Result<EndCallOutcome, BackendError>;
}

/// Reaches backend canisters through the platform's JSON RPC gateway at
/// `{base_url}/{canister}/{method}`.
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    base_url: String,
    http: reqwest::Client,
}

impl HttpChatBackend {
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.as_ref().trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn call<A, R>(&self, recipient: Recipient, method: &str, args: &A) -> Result<R, BackendError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}/{method}", self.base_url, recipient.canister_id());
        let response = self.http.post(url).json(args).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected { status, body });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn start_call(&self, recipient: Recipient, args: &StartCallArgs) -> Result<StartCallOutcome, BackendError> {
        self.call(recipient, "start_video_call", args).await
    }

    async fn end_call(&self, recipient: Recipient, args: &EndCallArgs) -> Result<EndCallOutcome, BackendError> {
        self.call(recipient, "end_video_call", args).await
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{recipient}: {source}")]
    Backend { recipient: Recipient, source: BackendError },
    #[error("{recipient} did not answer within {timeout:?}")]
    Timeout { recipient: Recipient, timeout: Duration },
    #[error("{recipient} refused to start the call")]
    NotAuthorized { recipient: Recipient },
}

/// The user starting a call, as shown in the "call started" message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiator {
    pub user_id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<AvatarId>,
}

/// Whether local bookkeeping waits for the backend to accept a start message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    /// Sent in the background; failures are logged only.
    BestEffort,
    /// Awaited; a failure aborts the start.
    Required,
}

impl StartPolicy {
    pub fn for_chat(chat_id: &ChatId) -> Self {
        match chat_id {
            ChatId::Direct(_) | ChatId::Channel(..) => StartPolicy::BestEffort,
            ChatId::Group(_) => StartPolicy::Required,
        }
    }
}

/// A meeting being finished, rebuilt from its store record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meeting {
    pub room_name: RoomName,
    pub message_id: MessageId,
    pub room: DecodedRoom,
}

impl Meeting {
    pub fn from_record(record: &InProgressMeeting) -> Result<Self, RoomNameError> {
        Ok(Self {
            room: record.room_name.decode()?,
            room_name: record.room_name.clone(),
            message_id: record.message_id,
        })
    }

    /// Everyone who must hear that the meeting ended. Each side of a one-to-one
    /// chat is told separately, naming the other side.
    pub fn end_notifications(&self) -> Vec<(Recipient, EndCallArgs)> {
        let message_id = self.message_id;
        match self.room {
            DecodedRoom::Direct(a, b) => vec![
                (Recipient::User(a), EndCallArgs { message_id, user_id: Some(b), channel_id: None }),
                (Recipient::User(b), EndCallArgs { message_id, user_id: Some(a), channel_id: None }),
            ],
            DecodedRoom::Group(group_id) => vec![(
                Recipient::Group(group_id),
                EndCallArgs { message_id, user_id: None, channel_id: None },
            )],
            DecodedRoom::Channel(community_id, channel_id) => vec![(
                Recipient::Community(community_id),
                EndCallArgs { message_id, user_id: None, channel_id: Some(channel_id) },
            )],
        }
    }
}

/// One notification attempt within a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub room_name: RoomName,
    pub recipient: Recipient,
}

/// Outcome of a settle-all fan-out, one entry per attempt.
#[derive(Debug, Default)]
pub struct FanOut {
    pub succeeded: Vec<Delivery>,
    pub failed: Vec<(Delivery, DispatchError)>,
}

impl FanOut {
    /// Rooms for which every recipient was notified.
    pub fn completed_rooms(&self) -> Vec<RoomName> {
        let mut rooms: Vec<RoomName> = self
            .succeeded
            .iter()
            .map(|delivery| delivery.room_name.clone())
            .filter(|room| !self.failed.iter().any(|(failed, _)| &failed.room_name == room))
            .collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ChatBackend>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn ChatBackend>, call_timeout: Duration) -> Self {
        Self { backend, call_timeout }
    }

    async fn start_on(&self, recipient: Recipient, args: &StartCallArgs) -> Result<(), DispatchError> {
        let outcome = tokio::time::timeout(self.call_timeout, self.backend.start_call(recipient, args))
            .await
            .map_err(|_| DispatchError::Timeout { recipient, timeout: self.call_timeout })?
            .map_err(|source| DispatchError::Backend { recipient, source })?;

        match outcome {
            StartCallOutcome::Success => Ok(()),
            StartCallOutcome::NotAuthorized => Err(DispatchError::NotAuthorized { recipient }),
        }
    }

    async fn end_on(&self, recipient: Recipient, args: &EndCallArgs) -> Result<EndCallOutcome, DispatchError> {
        tokio::time::timeout(self.call_timeout, self.backend.end_call(recipient, args))
            .await
            .map_err(|_| DispatchError::Timeout { recipient, timeout: self.call_timeout })?
            .map_err(|source| DispatchError::Backend { recipient, source })
    }

    /// Posts the "call started" message for `message_id`.
    pub async fn send_start(
        &self,
        chat_id: &ChatId,
        message_id: MessageId,
        initiator: &Initiator,
        call_type: CallType,
    ) -> Result<(), DispatchError> {
        let (recipient, channel_id) = match *chat_id {
            ChatId::Direct(other_user) => (Recipient::User(other_user), None),
            ChatId::Group(group_id) => (Recipient::Group(group_id), None),
            ChatId::Channel(community_id, channel_id) => (Recipient::Community(community_id), Some(channel_id)),
        };
        let args = StartCallArgs {
            message_id,
            initiator: initiator.user_id,
            initiator_username: initiator.username.clone(),
            initiator_display_name: initiator.display_name.clone(),
            initiator_avatar_id: initiator.avatar_id,
            call_type,
            channel_id,
        };
        tracing::debug!(%recipient, %message_id, "sending call started message");

        match StartPolicy::for_chat(chat_id) {
            StartPolicy::Required => {
                self.start_on(recipient, &args).await.inspect_err(|err| {
                    tracing::error!(error = %err, %message_id, "unable to send call started message");
                })?;
            }
            StartPolicy::BestEffort => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.start_on(recipient, &args).await {
                        tracing::error!(error = %err, %message_id, "unable to send call started message");
                    }
                });
            }
        }
        Ok(())
    }

    /// Notifies every recipient of every meeting concurrently. A failed
    /// notification never cancels its siblings.
    pub async fn send_finish(&self, meetings: &[Meeting]) -> FanOut {
        let attempts = meetings.iter().flat_map(|meeting| {
            meeting.end_notifications().into_iter().map(move |(recipient, args)| {
                let delivery = Delivery { room_name: meeting.room_name.clone(), recipient };
                async move {
                    let result = self.end_on(recipient, &args).await;
                    (delivery, result)
                }
            })
        });

        let mut fan_out = FanOut::default();
        for (delivery, result) in join_all(attempts).await {
            match result {
                Ok(outcome) => {
                    tracing::debug!(room = %delivery.room_name, recipient = %delivery.recipient, ?outcome, "meeting finished");
                    fan_out.succeeded.push(delivery);
                }
                Err(err) => {
                    tracing::warn!(room = %delivery.room_name, error = %err, "unable to finish meeting");
                    fan_out.failed.push((delivery, err));
                }
            }
        }
        fan_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, canister};

    fn dispatcher(backend: &Arc<FakeBackend>) -> Dispatcher {
        Dispatcher::new(backend.clone(), Duration::from_millis(200))
    }

    fn initiator() -> Initiator {
        Initiator {
            user_id: canister(1),
            username: "alice".to_owned(),
            display_name: Some("Alice".to_owned()),
            avatar_id: Some(AvatarId(u128::MAX)),
        }
    }

    fn meeting(room: DecodedRoom, message_id: u128) -> Meeting {
        let room_name = match room {
            DecodedRoom::Direct(a, b) => crate::roomname::encode(a, &ChatId::Direct(b)),
            DecodedRoom::Group(group_id) => crate::roomname::encode(canister(1), &ChatId::Group(group_id)),
            DecodedRoom::Channel(community_id, channel_id) => {
                crate::roomname::encode(canister(1), &ChatId::Channel(community_id, channel_id))
            }
        };
        Meeting { room_name, message_id: MessageId(message_id), room }
    }

    #[tokio::test]
    async fn group_start_is_awaited() {
        let backend = Arc::new(FakeBackend::default());
        let message_id = MessageId::new_random();
        dispatcher(&backend)
            .send_start(&ChatId::Group(canister(9)), message_id, &initiator(), CallType::Default)
            .await
            .unwrap();

        let starts = backend.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, Recipient::Group(canister(9)));
        assert_eq!(starts[0].1.message_id, message_id);
        assert_eq!(starts[0].1.initiator, canister(1));
    }

    #[tokio::test]
    async fn group_start_failure_is_raised() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_for(Recipient::Group(canister(9)));
        let err = dispatcher(&backend)
            .send_start(&ChatId::Group(canister(9)), MessageId(1), &initiator(), CallType::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Backend { .. }));

        backend.heal(Recipient::Group(canister(9)));
        backend.refuse_starts();
        let err = dispatcher(&backend)
            .send_start(&ChatId::Group(canister(9)), MessageId(1), &initiator(), CallType::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn direct_start_is_best_effort() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_for(Recipient::User(canister(2)));
        let result = dispatcher(&backend)
            .send_start(&ChatId::Direct(canister(2)), MessageId(1), &initiator(), CallType::Default)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn channel_start_carries_channel_id() {
        let backend = Arc::new(FakeBackend::default());
        let chat = ChatId::Channel(canister(5), ChannelId(u128::MAX));
        dispatcher(&backend).send_start(&chat, MessageId(1), &initiator(), CallType::Broadcast).await.unwrap();

        let starts = backend.wait_for_starts(1).await;
        assert_eq!(starts[0].0, Recipient::Community(canister(5)));
        assert_eq!(starts[0].1.channel_id, Some(ChannelId(u128::MAX)));
        assert_eq!(starts[0].1.call_type, CallType::Broadcast);
    }

    #[tokio::test]
    async fn direct_finish_notifies_both_sides() {
        let backend = Arc::new(FakeBackend::default());
        let (a, b) = (canister(1), canister(2));
        let fan_out = dispatcher(&backend).send_finish(&[meeting(DecodedRoom::Direct(a, b), 7)]).await;

        assert_eq!(fan_out.succeeded.len(), 2);
        assert!(fan_out.failed.is_empty());
        let mut ends: Vec<(Recipient, Option<UserId>)> =
            backend.ends().into_iter().map(|(recipient, args)| (recipient, args.user_id)).collect();
        ends.sort_by_key(|(recipient, _)| recipient.canister_id().as_bytes().to_vec());
        assert_eq!(ends, vec![(Recipient::User(a), Some(b)), (Recipient::User(b), Some(a))]);
    }

    #[tokio::test]
    async fn failures_do_not_abort_siblings() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_for(Recipient::Group(canister(4)));
        let ok = meeting(DecodedRoom::Group(canister(3)), 1);
        let bad = meeting(DecodedRoom::Group(canister(4)), 2);
        let channel = meeting(DecodedRoom::Channel(canister(5), ChannelId(77)), 3);

        let fan_out = dispatcher(&backend).send_finish(&[ok.clone(), bad.clone(), channel.clone()]).await;

        assert_eq!(fan_out.succeeded.len(), 2);
        assert_eq!(fan_out.failed.len(), 1);
        assert_eq!(fan_out.failed[0].0.room_name, bad.room_name);
        let mut expected = vec![ok.room_name, channel.room_name];
        expected.sort();
        assert_eq!(fan_out.completed_rooms(), expected);
        assert_eq!(backend.ends().len(), 3);
    }

    #[tokio::test]
    async fn half_delivered_direct_meeting_is_not_complete() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_for(Recipient::User(canister(2)));
        let fan_out = dispatcher(&backend)
            .send_finish(&[meeting(DecodedRoom::Direct(canister(1), canister(2)), 9)])
            .await;

        assert_eq!(fan_out.succeeded.len(), 1);
        assert_eq!(fan_out.failed.len(), 1);
        assert!(fan_out.completed_rooms().is_empty());
    }

    #[tokio::test]
    async fn idempotent_outcomes_count_as_success() {
        let backend = Arc::new(FakeBackend::default());
        backend.answer_ends_with(EndCallOutcome::AlreadyEnded);
        let fan_out = dispatcher(&backend).send_finish(&[meeting(DecodedRoom::Group(canister(3)), 1)]).await;
        assert_eq!(fan_out.completed_rooms().len(), 1);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_failure() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_delay(Duration::from_secs(5));
        let dispatcher = Dispatcher::new(backend.clone(), Duration::from_millis(20));
        let fan_out = dispatcher.send_finish(&[meeting(DecodedRoom::Group(canister(3)), 1)]).await;

        assert!(fan_out.succeeded.is_empty());
        assert!(matches!(fan_out.failed[0].1, DispatchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn start_args_wire_format() {
        let backend = Arc::new(FakeBackend::default());
        dispatcher(&backend)
            .send_start(&ChatId::Group(canister(9)), MessageId(5), &initiator(), CallType::Default)
            .await
            .unwrap();

        let json = serde_json::to_value(&backend.starts()[0].1).unwrap();
        assert_eq!(json["message_id"], "5");
        assert_eq!(json["initiator_avatar_id"], u128::MAX.to_string());
        assert!(json.get("channel_id").is_none());
    }

    #[test]
    fn end_args_wire_format() {
        let args = EndCallArgs { message_id: MessageId(5), user_id: None, channel_id: Some(ChannelId(6)) };
        assert_eq!(
            serde_json::to_value(&args).unwrap(),
            serde_json::json!({"message_id": "5", "channel_id": "6"})
        );
        let outcome: EndCallOutcome = serde_json::from_str(r#""MessageNotFound""#).unwrap();
        assert_eq!(outcome, EndCallOutcome::MessageNotFound);
        let outcome: StartCallOutcome = serde_json::from_str(r#""Success""#).unwrap();
        assert_eq!(outcome, StartCallOutcome::Success);
    }

    #[test]
    fn start_policy_per_kind() {
        assert_eq!(StartPolicy::for_chat(&ChatId::Group(canister(1))), StartPolicy::Required);
        assert_eq!(StartPolicy::for_chat(&ChatId::Direct(canister(1))), StartPolicy::BestEffort);
        assert_eq!(
            StartPolicy::for_chat(&ChatId::Channel(canister(1), ChannelId(1))),
            StartPolicy::BestEffort
        );
    }
}
