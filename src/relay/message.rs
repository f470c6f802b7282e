// Message types and protocol for the direct message relay

use crate::relay::channel::ChannelId;
use crate::relay::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identity of a user as issued by the auth collaborator
///
/// Valid identifiers are `1..=UserId::MAX`, the range a SQLite INTEGER
/// column holds. Anything else is rejected when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct UserId(NonZeroU64);

impl UserId {
    pub const MAX: u64 = i64::MAX as u64;

    /// Returns `None` for zero or anything above `UserId::MAX`
    pub fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX {
            return None;
        }
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for UserId {
    type Error = RelayError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        UserId::new(raw)
            .ok_or_else(|| RelayError::InvalidMessage(format!("user id {} out of range", raw)))
    }
}

impl From<UserId> for u64 {
    fn from(id: UserId) -> Self {
        id.get()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .ok()
            .and_then(UserId::new)
            .ok_or_else(|| RelayError::InvalidMessage(format!("malformed user id: {:?}", s)))
    }
}

/// A persisted direct message
///
/// `id` and `created_at` are assigned by the store, never by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned, strictly increasing identifier
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// When the store accepted the message, Unix milliseconds on the wire
    #[serde(with = "unix_millis")]
    pub created_at: SystemTime,
}

/// `SystemTime` as Unix milliseconds, the unit the store keeps
pub(crate) mod unix_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn to_millis(time: SystemTime) -> i64 {
        time.duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    pub fn from_millis(millis: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
    }

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(to_millis(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        if millis < 0 {
            return Err(serde::de::Error::custom("created_at before the Unix epoch"));
        }
        Ok(from_millis(millis))
    }
}

impl Message {
    /// Channel this message belongs to
    pub fn channel(&self) -> Result<ChannelId, RelayError> {
        ChannelId::between(self.sender_id, self.receiver_id)
    }
}

/// Protocol messages exchanged between clients and server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Client authentication request, must be the first frame
    Auth {
        token: String,
    },
    /// Authentication response
    AuthResponse {
        success: bool,
        user_id: Option<UserId>,
        message: String,
    },
    /// Join the conversation with a peer
    Join {
        peer_id: UserId,
    },
    /// Join confirmation carrying the full backlog, oldest first
    Joined {
        channel: ChannelId,
        history: Vec<Message>,
    },
    /// Stop receiving live messages for a conversation
    Leave {
        peer_id: UserId,
    },
    /// Leave confirmation
    Left {
        channel: ChannelId,
    },
    /// Client sending a message to a peer
    Send {
        peer_id: UserId,
        content: String,
    },
    /// Confirmation to the sender once the message is persisted
    Sent {
        message: Message,
    },
    /// Server fanning out a persisted message to channel members
    Deliver {
        message: Message,
    },
    /// Ping to keep connection alive
    Ping,
    /// Pong response
    Pong,
    /// Error message
    Error {
        kind: String,
        message: String,
    },
}

impl ProtocolMessage {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n'); // Add newline delimiter
        Ok(bytes)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Build the `error` frame for a core error
    pub fn from_error(err: &RelayError) -> Self {
        ProtocolMessage::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
