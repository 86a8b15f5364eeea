//! Room names: a chat identifier squeezed into the provider's naming rules.
//!
//! Room names must be 40 characters or fewer and limited to a URL-safe charset,
//! yet the bridge has to get the chat back out of a name it only sees in presence
//! data and webhooks. A name is a one-character kind tag followed by fixed-width
//! base64 segments, so decoding is a matter of slicing.
//!
//! | kind    | layout                                             | length |
//! |---------|----------------------------------------------------|--------|
//! | group   | `G` + group (14)                                   | 15     |
//! | direct  | `D` + lower user (14) + higher user (14)           | 29     |
//! | channel | `C` + community (14) + channel as u128 BE (22)     | 37     |

use std::fmt;

use base64::Engine as _;
use base64::alphabet::Alphabet;
use base64::engine::{GeneralPurpose, general_purpose};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{CanisterId, ChannelId, ChatId, CommunityId, GroupId, IdError, UserId};

pub const MAX_ROOM_NAME_LEN: usize = 40;

const CANISTER_SEGMENT_LEN: usize = 14;
const CHANNEL_SEGMENT_LEN: usize = 22;

const GROUP_TAG: char = 'G';
const DIRECT_TAG: char = 'D';
const CHANNEL_TAG: char = 'C';

// Standard base64 with `+` and `/` swapped for `_` and `-`. Existing rooms were
// named with this substitution, so it cannot change.
const ROOM_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("room alphabet must be 64 unique ascii characters"),
    };
const ROOM_ENGINE: GeneralPurpose = GeneralPurpose::new(&ROOM_ALPHABET, general_purpose::NO_PAD);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomNameError {
    #[error("empty room name")]
    Empty,
    #[error("unknown room kind {0:?}")]
    UnknownKind(char),
    #[error("room name of kind {kind:?} must carry {expected} characters after the tag, found {actual}")]
    Length { kind: char, expected: usize, actual: usize },
    #[error("room name contains characters outside the room alphabet")]
    Charset,
    #[error("malformed room name segment: {0}")]
    Segment(#[from] base64::DecodeError),
    #[error(transparent)]
    Id(#[from] IdError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn decode(&self) -> Result<DecodedRoom, RoomNameError> {
        decode(&self.0)
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RoomName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for RoomName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// What a room name decodes back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedRoom {
    /// Both participants of a one-to-one chat, in wire order.
    Direct(UserId, UserId),
    Group(GroupId),
    Channel(CommunityId, ChannelId),
}

impl DecodedRoom {
    /// The chat identifiers the room serves. A direct room serves one chat per
    /// participant, each named by the other side.
    pub fn chat_ids(&self) -> Vec<ChatId> {
        match *self {
            DecodedRoom::Direct(a, b) => vec![ChatId::Direct(a), ChatId::Direct(b)],
            DecodedRoom::Group(group_id) => vec![ChatId::Group(group_id)],
            DecodedRoom::Channel(community_id, channel_id) => vec![ChatId::Channel(community_id, channel_id)],
        }
    }
}

pub fn encode(requesting_user: UserId, chat_id: &ChatId) -> RoomName {
    let name = match *chat_id {
        ChatId::Group(group_id) => format!("{GROUP_TAG}{}", encode_canister(&group_id)),
        ChatId::Direct(other_user) => {
            // both sides must land in the same room, so order by principal text
            let mut users = [requesting_user.to_string(), other_user.to_string()];
            users.sort();
            let (first, second) = if users[0] == requesting_user.to_string() {
                (requesting_user, other_user)
            } else {
                (other_user, requesting_user)
            };
            format!("{DIRECT_TAG}{}{}", encode_canister(&first), encode_canister(&second))
        }
        ChatId::Channel(community_id, channel_id) => format!(
            "{CHANNEL_TAG}{}{}",
            encode_canister(&community_id),
            ROOM_ENGINE.encode(channel_id.0.to_be_bytes())
        ),
    };
    debug_assert!(name.len() <= MAX_ROOM_NAME_LEN);
    RoomName(name)
}

pub fn decode(room_name: &str) -> Result<DecodedRoom, RoomNameError> {
    let mut chars = room_name.chars();
    let tag = chars.next().ok_or(RoomNameError::Empty)?;
    let body = chars.as_str();

    let expected = match tag {
        GROUP_TAG => CANISTER_SEGMENT_LEN,
        DIRECT_TAG => 2 * CANISTER_SEGMENT_LEN,
        CHANNEL_TAG => CANISTER_SEGMENT_LEN + CHANNEL_SEGMENT_LEN,
        other => return Err(RoomNameError::UnknownKind(other)),
    };
    if !body.is_ascii() {
        return Err(RoomNameError::Charset);
    }
    if body.len() != expected {
        return Err(RoomNameError::Length { kind: tag, expected, actual: body.len() });
    }

    let (head, tail) = body.split_at(CANISTER_SEGMENT_LEN);
    let head = decode_canister(head)?;
    Ok(match tag {
        GROUP_TAG => DecodedRoom::Group(head),
        DIRECT_TAG => DecodedRoom::Direct(head, decode_canister(tail)?),
        _ => DecodedRoom::Channel(head, decode_channel(tail)?),
    })
}

fn encode_canister(id: &CanisterId) -> String {
    ROOM_ENGINE.encode(id.as_bytes())
}

fn decode_canister(segment: &str) -> Result<CanisterId, RoomNameError> {
    let bytes = ROOM_ENGINE.decode(segment)?;
    Ok(CanisterId::from_slice(&bytes)?)
}

fn decode_channel(segment: &str) -> Result<ChannelId, RoomNameError> {
    let bytes = ROOM_ENGINE.decode(segment)?;
    let raw: [u8; 16] = bytes.as_slice().try_into().map_err(|_| RoomNameError::Length {
        kind: CHANNEL_TAG,
        expected: CANISTER_SEGMENT_LEN + CHANNEL_SEGMENT_LEN,
        actual: CANISTER_SEGMENT_LEN + segment.len(),
    })?;
    Ok(ChannelId(u128::from_be_bytes(raw)))
}
