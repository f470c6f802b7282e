// Conversation addressing: one canonical channel per unordered user pair

use crate::relay::error::RelayError;
use crate::relay::message::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical identifier of the conversation between two users
///
/// Always holds `low < high`, so the same pair maps to the same value
/// whichever side opens it. Rendered as `"<low>-<high>"` in decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChannelId {
    low: UserId,
    high: UserId,
}

impl ChannelId {
    /// Channel between `a` and `b`, in either order
    pub fn between(a: UserId, b: UserId) -> Result<Self, RelayError> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Ok(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => Err(RelayError::InvalidPair(a.get())),
        }
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    /// Whether `user` is one of the two participants
    pub fn includes(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl From<ChannelId> for String {
    fn from(channel: ChannelId) -> Self {
        channel.to_string()
    }
}

impl FromStr for ChannelId {
    type Err = RelayError;

    /// Accepts only the canonical rendering
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RelayError::InvalidMessage(format!("malformed channel id: {:?}", s));

        let (low, high) = s.split_once('-').ok_or_else(malformed)?;
        let low = parse_canonical(low).ok_or_else(malformed)?;
        let high = parse_canonical(high).ok_or_else(malformed)?;

        if low >= high {
            return Err(malformed());
        }

        Ok(Self { low, high })
    }
}

impl TryFrom<String> for ChannelId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Decimal digits only, no leading zeros
fn parse_canonical(part: &str) -> Option<UserId> {
    if part.is_empty() || part.starts_with('0') || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse::<u64>().ok().and_then(UserId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn uid(raw: u64) -> UserId {
        UserId::new(raw).unwrap()
    }

    #[test]
    fn test_channel_is_order_independent() {
        for (a, b) in [(1, 2), (7, 3), (10, 1), (u64::MAX, 1)] {
            assert_eq!(
                ChannelId::between(uid(a), uid(b)).unwrap(),
                ChannelId::between(uid(b), uid(a)).unwrap()
            );
        }
    }

    #[test]
    fn test_self_channel_is_invalid_pair() {
        for a in [1, 2, 99, u64::MAX] {
            let err = ChannelId::between(uid(a), uid(a)).unwrap_err();
            assert!(matches!(err, RelayError::InvalidPair(x) if x == a));
        }
    }

    #[test]
    fn test_distinct_pairs_never_collide() {
        // 1-12 vs 11-2 style collisions are what naive concatenation risks
        let mut seen: HashMap<String, (u64, u64)> = HashMap::new();
        for a in 1..=40u64 {
            for b in (a + 1)..=40u64 {
                let rendered = ChannelId::between(uid(a), uid(b)).unwrap().to_string();
                if let Some(previous) = seen.insert(rendered.clone(), (a, b)) {
                    panic!("{} produced by {:?} and {:?}", rendered, previous, (a, b));
                }
            }
        }
    }

    #[test]
    fn test_rendering_is_min_dash_max() {
        let channel = ChannelId::between(uid(2), uid(1)).unwrap();
        assert_eq!(channel.to_string(), "1-2");
        assert_eq!(channel.low(), uid(1));
        assert_eq!(channel.high(), uid(2));
        assert_eq!(channel.peer_of(uid(1)), Some(uid(2)));
        assert_eq!(channel.peer_of(uid(3)), None);
        assert!(channel.includes(uid(2)));
    }

    #[test]
    fn test_parse_accepts_only_canonical_form() {
        let channel: ChannelId = "3-14".parse().unwrap();
        assert_eq!(channel, ChannelId::between(uid(14), uid(3)).unwrap());

        for bad in ["14-3", "3-3", "03-14", "3-014", "+3-14", "3--14", "3", "", "0-5", "a-b"] {
            assert!(bad.parse::<ChannelId>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_serializes_as_string() {
        let channel = ChannelId::between(uid(5), uid(9)).unwrap();
        assert_eq!(serde_json::to_string(&channel).unwrap(), "\"5-9\"");
        let back: ChannelId = serde_json::from_str("\"5-9\"").unwrap();
        assert_eq!(back, channel);
        assert!(serde_json::from_str::<ChannelId>("\"9-5\"").is_err());
    }
}
