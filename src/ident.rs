//! Identity and time atoms.
//!
//! ActorId: the editor an edit is attributed to.
//! WallClock: millisecond wall time for revision ordering display.
//! Stamp: wall time + attribution, carried by every committed revision.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid actor identifier.
#[derive(Debug, Error, Clone)]
#[error("actor id `{raw}` is invalid: {reason}")]
pub struct InvalidActorId {
    pub raw: String,
    pub reason: String,
}

/// Actor identifier - non-empty string.
///
/// No validation beyond non-empty; the surrounding application owns
/// authentication.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidActorId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidActorId {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({:?})", self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall clock in milliseconds since the Unix epoch.
///
/// Copy is fine here - it is a measurement, not an ordering primitive:
/// revision order comes from row ids, which are append-ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(ms)
    }
}

/// Stamp = wall time + attribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub at: WallClock,
    pub by: ActorId,
}

impl Stamp {
    pub fn new(at: WallClock, by: ActorId) -> Self {
        Self { at, by }
    }

    pub fn now(by: ActorId) -> Self {
        Self {
            at: WallClock::now(),
            by,
        }
    }
}
