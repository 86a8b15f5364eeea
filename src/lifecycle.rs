//! Starting, joining and finishing meetings.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;

use crate::auth::{AccessClaims, AuthError};
use crate::dispatch::{DispatchError, Dispatcher, Initiator, Meeting};
use crate::ids::{AvatarId, CallType, MessageId};
use crate::provider::{MeetingTokenRequest, ProviderError, VideoProvider};
use crate::roomname::{self, RoomName, RoomNameError};
use crate::store::{InProgressMeeting, MeetingStore, StoreError};

#[derive(Debug, Error)]
pub enum MeetingError {
    #[error("there is no meeting in progress for room {0}")]
    NoMeetingInProgress(RoomName),
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error(transparent)]
    RoomName(#[from] RoomNameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOrJoin {
    pub room_name: RoomName,
    pub message_id: MessageId,
    pub joining: bool,
}

/// How the caller wants to appear in the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerProfile {
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<AvatarId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub token: String,
    pub room_name: RoomName,
    pub message_id: MessageId,
    pub joining: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FinishReport {
    /// Every recipient was told; the record is gone.
    pub finished: Vec<RoomName>,
    /// Kept for a later attempt.
    pub retained: Vec<RoomName>,
    /// Records whose room name could not be decoded.
    pub undecodable: Vec<RoomName>,
}

pub struct MeetingService {
    store: Arc<dyn MeetingStore>,
    provider: Arc<dyn VideoProvider>,
    dispatcher: Dispatcher,
    meeting_ttl: Duration,
}

impl MeetingService {
    pub fn new(
        store: Arc<dyn MeetingStore>,
        provider: Arc<dyn VideoProvider>,
        dispatcher: Dispatcher,
        meeting_ttl: Duration,
    ) -> Self {
        Self { store, provider, dispatcher, meeting_ttl }
    }

    pub async fn meetings(&self) -> Result<Vec<InProgressMeeting>, MeetingError> {
        Ok(self.store.get_all().await?)
    }

    /// Joins the meeting already recorded for the caller's room, or starts one
    /// when the caller is allowed to.
    pub async fn start_or_join(
        &self,
        claims: &AccessClaims,
        initiator: &Initiator,
        call_type: CallType,
    ) -> Result<StartOrJoin, MeetingError> {
        let room_name = roomname::encode(claims.user_id, &claims.chat_id);
        let message_id = MessageId::new_random();

        // the room is claimed before anyone is told, so concurrent starters
        // agree on a single message id
        loop {
            if let Some(existing) = self.store.get(&room_name).await? {
                tracing::debug!(room = %room_name, "call in progress so we will be joining");
                return Ok(StartOrJoin { room_name, message_id: existing.message_id, joining: true });
            }
            if claims.joining() {
                tracing::debug!(room = %room_name, "trying to join when there is no meeting in progress");
                return Err(MeetingError::NoMeetingInProgress(room_name));
            }

            let record = InProgressMeeting::tentative(room_name.clone(), message_id, claims.user_id, self.meeting_ttl);
            if self.store.claim(&record).await? {
                break;
            }
            tracing::debug!(room = %room_name, "meeting was started by a concurrent request");
        }

        if let Err(err) = self.dispatcher.send_start(&claims.chat_id, message_id, initiator, call_type).await {
            if let Err(store_err) = self.store.delete(&room_name).await {
                tracing::error!(room = %room_name, error = %store_err, "unable to release room after failed start");
            }
            return Err(err.into());
        }
        tracing::info!(room = %room_name, %message_id, ?call_type, "meeting started");

        Ok(StartOrJoin { room_name, message_id, joining: false })
    }

    /// Everything a client needs to enter the call for its chat.
    pub async fn access_token(&self, claims: &AccessClaims, profile: CallerProfile) -> Result<AccessGrant, MeetingError> {
        let room_name = roomname::encode(claims.user_id, &claims.chat_id);

        let room = match self.provider.get_room(&room_name).await? {
            Some(room) => room,
            None if claims.joining() => return Err(MeetingError::NoMeetingInProgress(room_name)),
            None => self.provider.create_room(&room_name, claims.call_type).await?,
        };
        let call_type = room.call_type();

        let initiator = Initiator {
            user_id: claims.user_id,
            username: profile.username,
            display_name: profile.display_name,
            avatar_id: profile.avatar_id,
        };
        let StartOrJoin { room_name, message_id, joining } =
            self.start_or_join(claims, &initiator, call_type).await?;

        let token = self
            .provider
            .meeting_token(&MeetingTokenRequest {
                room_name: &room_name,
                user_id: claims.user_id,
                username: &initiator.username,
                joining: claims.joining(),
                call_type,
            })
            .await?;

        Ok(AccessGrant { token, room_name, message_id, joining })
    }

    /// A participant asked for their meeting to end.
    pub async fn end_meeting(&self, claims: &AccessClaims) -> Result<FinishReport, MeetingError> {
        let room_name = roomname::encode(claims.user_id, &claims.chat_id);
        self.finish_room(&room_name).await
    }

    /// Finishes whatever is recorded for `room_name`. Nothing recorded, nothing
    /// to do.
    pub async fn finish_room(&self, room_name: &RoomName) -> Result<FinishReport, MeetingError> {
        match self.store.get(room_name).await? {
            Some(record) => Ok(self.finish_records(&[record]).await),
            None => {
                tracing::debug!(room = %room_name, "no meeting in progress to finish");
                Ok(FinishReport::default())
            }
        }
    }

    pub async fn finish_records(&self, records: &[InProgressMeeting]) -> FinishReport {
        let mut report = FinishReport::default();
        let mut meetings = Vec::with_capacity(records.len());
        for record in records {
            match Meeting::from_record(record) {
                Ok(meeting) => meetings.push(meeting),
                Err(err) => {
                    tracing::error!(room = %record.room_name, error = %err, "unable to decode room name");
                    report.undecodable.push(record.room_name.clone());
                }
            }
        }
        if meetings.is_empty() {
            return report;
        }

        let fan_out = self.dispatcher.send_finish(&meetings).await;
        let completed = fan_out.completed_rooms();

        for meeting in &meetings {
            if !completed.contains(&meeting.room_name) {
                report.retained.push(meeting.room_name.clone());
            }
        }

        let cleanups = completed.into_iter().map(|room_name| async move {
            if let Err(err) = self.provider.delete_room(&room_name).await {
                tracing::warn!(room = %room_name, error = %err, "unable to delete provider room");
            }
            let deleted = self.store.delete(&room_name).await;
            (room_name, deleted)
        });
        for (room_name, deleted) in join_all(cleanups).await {
            match deleted {
                Ok(_) => {
                    tracing::info!(room = %room_name, "meeting finished");
                    report.finished.push(room_name);
                }
                Err(err) => {
                    tracing::error!(room = %room_name, error = %err, "unable to remove in-progress record");
                    report.retained.push(room_name);
                }
            }
        }

        if !report.retained.is_empty() {
            tracing::warn!(retained = report.retained.len(), "some meetings could not be finished and will be retried");
        }
        report
    }
}
