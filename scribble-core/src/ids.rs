//! Identifiers, wall-clock timestamps and the per-process stroke id generator.
//!
//! Session and user ids are opaque strings handed to us by clients and the
//! identity provider. Stroke ids are plain integers minted locally:
//!
//! ```text
//! stroke_id = fnv1a(user_id) + process_seed + counter
//! ```
//!
//! They are unique within one generator's lifetime and never coordinated
//! across nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Key of a drawing session. Also the routing and journal key.
    SessionId
);

string_id!(
    /// Opaque user identity supplied by the identity provider.
    UserId
);

string_id!(
    /// Name of a cluster node. Shard owners are nodes.
    NodeId
);

/// Identifier of a single stroke within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrokeId(pub u64);

impl fmt::Display for StrokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The "never updated" timestamp of a fresh session.
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// 64-bit FNV-1a. Stable across processes and platforms, unlike `std`'s
/// randomly keyed hasher, so it is safe for shard placement.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325; // FNV offset basis
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3); // FNV prime
    }
    hash
}

/// Mints stroke ids for one pipeline instance.
#[derive(Debug, Clone)]
pub struct StrokeIdGenerator {
    seed: u64,
    counter: u64,
}

impl StrokeIdGenerator {
    /// Generator with a random seed.
    pub fn new() -> Self {
        Self::with_seed(Uuid::new_v4().as_u128() as u64)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    pub fn next_id(&mut self, user_id: &UserId) -> StrokeId {
        let id = fnv1a_64(user_id.as_str().as_bytes())
            .wrapping_add(self.seed)
            .wrapping_add(self.counter);
        self.counter = self.counter.wrapping_add(1);
        StrokeId(id)
    }

    /// Number of ids minted so far.
    pub fn issued(&self) -> u64 {
        self.counter
    }
}

impl Default for StrokeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
