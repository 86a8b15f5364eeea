//! Identifiers shared by the messaging platform and the call provider.
//!
//! Users, groups and communities are all addressed by canister principals. Only
//! the 10-byte canister form is supported: it is what the room-name codec can fit
//! into a fixed-width segment.

use std::fmt;
use std::str::FromStr;

use base32::Alphabet;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CANISTER_ID_LEN: usize = 10;

const CHECKSUM_LEN: usize = 4;
const GROUP_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid principal text {0:?}")]
    InvalidText(String),
    #[error("principal {0:?} has a bad checksum")]
    Checksum(String),
    #[error("principal {text:?} is {len} bytes, expected {CANISTER_ID_LEN}")]
    Length { text: String, len: usize },
    #[error("invalid numeric id {0:?}")]
    InvalidNumber(String),
}

/// A canister principal, e.g. `cpmcr-yeaaa-aaaaa-qaala-cai`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanisterId([u8; CANISTER_ID_LEN]);

/// One-to-one chats are addressed by the other user's id.
pub type UserId = CanisterId;
pub type GroupId = CanisterId;
pub type CommunityId = CanisterId;

impl CanisterId {
    pub const fn from_bytes(bytes: [u8; CANISTER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let raw: [u8; CANISTER_ID_LEN] = bytes.try_into().map_err(|_| IdError::Length {
            text: format!("{bytes:02x?}"),
            len: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; CANISTER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for CanisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::with_capacity(CHECKSUM_LEN + CANISTER_ID_LEN);
        buf.extend_from_slice(&crc32fast::hash(&self.0).to_be_bytes());
        buf.extend_from_slice(&self.0);

        let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, &buf).to_ascii_lowercase();
        let groups: Vec<&str> = encoded
            .as_bytes()
            .chunks(GROUP_LEN)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
            .collect();
        f.write_str(&groups.join("-"))
    }
}

impl fmt::Debug for CanisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanisterId({self})")
    }
}

impl FromStr for CanisterId {
    type Err = IdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let compact: String = text.chars().filter(|c| *c != '-').collect();
        let Some(decoded) = base32::decode(Alphabet::Rfc4648 { padding: false }, &compact.to_ascii_uppercase()) else {
            return Err(IdError::InvalidText(text.to_owned()));
        };
        if decoded.len() < CHECKSUM_LEN {
            return Err(IdError::InvalidText(text.to_owned()));
        }

        let (checksum, body) = decoded.split_at(CHECKSUM_LEN);
        if checksum != crc32fast::hash(body).to_be_bytes() {
            return Err(IdError::Checksum(text.to_owned()));
        }

        let id = Self::from_slice(body).map_err(|_| IdError::Length {
            text: text.to_owned(),
            len: body.len(),
        })?;

        // only the canonical lowercase, dash-grouped spelling is accepted
        if id.to_string() != text {
            return Err(IdError::InvalidText(text.to_owned()));
        }
        Ok(id)
    }
}

impl TryFrom<String> for CanisterId {
    type Error = IdError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<CanisterId> for String {
    fn from(id: CanisterId) -> Self {
        id.to_string()
    }
}

/// Channels are numbered within their community. The id space is 128 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct ChannelId(pub u128);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = IdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        text.parse::<u128>()
            .map(ChannelId)
            .map_err(|_| IdError::InvalidNumber(text.to_owned()))
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(ChannelId(u128::from(n))),
        }
    }
}

/// Identifies the "call started" message. Minted once per call and carried
/// through confirmation and finish. Serialized as a decimal string so JSON
/// consumers never see it rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(pub u128);

impl MessageId {
    pub fn new_random() -> Self {
        Self(Uuid::now_v7().as_u128())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = IdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        text.parse::<u128>()
            .map(MessageId)
            .map_err(|_| IdError::InvalidNumber(text.to_owned()))
    }
}

impl TryFrom<String> for MessageId {
    type Error = IdError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.to_string()
    }
}

/// A user's avatar blob. Sent as a decimal string like [`MessageId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AvatarId(pub u128);

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AvatarId {
    type Err = IdError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        text.parse::<u128>()
            .map(AvatarId)
            .map_err(|_| IdError::InvalidNumber(text.to_owned()))
    }
}

impl TryFrom<String> for AvatarId {
    type Error = IdError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<AvatarId> for String {
    fn from(id: AvatarId) -> Self {
        id.to_string()
    }
}

/// Where a chat lives on the messaging platform.
///
/// Serialized in the platform's wire form: `{"Direct": id}`, `{"Group": id}`,
/// `{"Channel": [communityId, channelId]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatId {
    /// A one-to-one chat, named by the other participant.
    Direct(UserId),
    Group(GroupId),
    Channel(CommunityId, ChannelId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    #[default]
    Default,
    Broadcast,
}
