//! Identifier types.
//!
//! Events are numbered by the log. Holons and relationships carry string
//! ids, either caller supplied or derived from the creating event so that
//! replay reproduces them exactly.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Namespace for ids derived from event ids (UUID v5).
const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2b4e_93a7_4c1e_8d55_0b3a_7e29_c4f1);

/// Monotonically increasing event id assigned by the event log. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Deterministic id for an entity created by `event_id` without a
            /// caller-supplied id.
            pub fn derived(event_id: EventId) -> Self {
                let name = format!("{}:{}", $prefix, event_id.0);
                let uuid = Uuid::new_v5(&DERIVED_ID_NAMESPACE, name.as_bytes());
                Self(format!("{}-{}", $prefix, uuid.simple()))
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
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(HolonId, "h");
string_id!(RelationshipId, "r");

/// Validate that an id matches `[a-zA-Z0-9_.:-]+`.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(EngineError::InvalidEvent(
            "empty id: must match [a-zA-Z0-9_.:-]+".to_string(),
        ));
    }
    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && !matches!(ch, '_' | '-' | '.' | ':') {
            return Err(EngineError::InvalidEvent(format!(
                "invalid id {:?}: must match [a-zA-Z0-9_.:-]+",
                id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_accepts_plain_ids() {
        assert!(validate_id("pos-1").is_ok());
        assert!(validate_id("org:unit_4.b").is_ok());
    }

    #[test]
    fn validate_id_rejects_spaces_and_empty() {
        assert!(validate_id("pos 1").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let a = HolonId::derived(EventId(7));
        let b = HolonId::derived(EventId(7));
        let c = HolonId::derived(EventId(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("h-"));
        assert!(validate_id(a.as_str()).is_ok());
        assert_ne!(
            HolonId::derived(EventId(7)).as_str(),
            RelationshipId::derived(EventId(7)).as_str()
        );
    }
}
