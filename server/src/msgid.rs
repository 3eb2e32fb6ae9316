//! Process-unique message identifiers.
//!
//! A message id packs `(unix seconds, uuid fragment, pid low 16 bits, counter)`
//! into 128 bits. The uuid fragment is re-drawn every [`FRAGMENT_ROTATION`]
//! emissions and on counter wrap, which keeps ids cheap while bounding the
//! collision window. Not cryptographic.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// How many emissions share one uuid fragment.
pub const FRAGMENT_ROTATION: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    seconds: u32,
    fragment: u32,
    pid: u16,
    counter: u32,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:08x}-{:04x}-{:08x}",
            self.seconds, self.fragment, self.pid, self.counter
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed message id")]
pub struct ParseMessageIdError;

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let seconds = next_group(&mut parts, 8)?;
        let fragment = next_group(&mut parts, 8)?;
        let pid = next_group(&mut parts, 4)? as u16;
        let counter = next_group(&mut parts, 8)?;
        if parts.next().is_some() {
            return Err(ParseMessageIdError);
        }
        Ok(MessageId {
            seconds,
            fragment,
            pid,
            counter,
        })
    }
}

fn next_group<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    width: usize,
) -> Result<u32, ParseMessageIdError> {
    let group = parts.next().ok_or(ParseMessageIdError)?;
    if group.len() != width {
        return Err(ParseMessageIdError);
    }
    u32::from_str_radix(group, 16).map_err(|_| ParseMessageIdError)
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Thread-safe generator. One per process; see [`next_id`].
pub struct MessageIdGenerator {
    pid: u16,
    counter: AtomicU32,
    fragment: AtomicU32,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            pid: (std::process::id() & 0xFFFF) as u16,
            counter: AtomicU32::new(1),
            fragment: AtomicU32::new(random_fragment()),
        }
    }

    pub fn next(&self) -> MessageId {
        // Force-acquire the latest increment before deciding on rotation.
        let mut counter = self.counter.load(Ordering::Acquire);

        if counter % FRAGMENT_ROTATION == 0 || counter == u32::MAX {
            self.fragment.store(random_fragment(), Ordering::Release);
        }

        if counter == u32::MAX {
            counter = 0;
        }
        counter += 1;

        // No matter which thread stores last, relaxed is enough here.
        self.counter.store(counter, Ordering::Relaxed);

        MessageId {
            seconds: unix_seconds(),
            fragment: self.fragment.load(Ordering::Acquire),
            pid: self.pid,
            counter,
        }
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn random_fragment() -> u32 {
    let bytes = *uuid::Uuid::new_v4().as_bytes();
    u32::from_be_bytes([bytes[0], bytes[5], bytes[10], bytes[15]])
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

static GENERATOR: Lazy<MessageIdGenerator> = Lazy::new(MessageIdGenerator::new);

/// Next id from the process-wide generator.
pub fn next_id() -> MessageId {
    GENERATOR.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn canonical_form_round_trips() {
        let id = next_id();
        let rendered = id.to_string();
        assert_eq!(rendered.split('-').count(), 4);
        let parsed: MessageId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("".parse::<MessageId>().is_err());
        assert!("zz".parse::<MessageId>().is_err());
        assert!("00000001-00000002-0001".parse::<MessageId>().is_err());
        assert!("00000001-00000002-0001-00000003-ff"
            .parse::<MessageId>()
            .is_err());
        // wrong group width
        assert!("1-00000002-0001-00000003".parse::<MessageId>().is_err());
    }

    #[test]
    fn ids_are_unique_within_a_burst() {
        let gen = MessageIdGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(gen.next()));
        }
    }

    #[test]
    fn counter_advances_monotonically_between_rotations() {
        let gen = MessageIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_eq!(b.counter, a.counter + 1);
    }

    #[test]
    fn serde_uses_the_canonical_string() {
        let id = next_id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
