//! Identifiers
//!
//! Run, session, batch, call and request ids are `<prefix>_<utc timestamp>_<random hex>`:
//! time-ordered and unique without any shared counter.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Build a fresh id with the given prefix.
pub fn new_id(prefix: &str) -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9f");
    let seed: [u8; 6] = rand::random();
    let hex: String = seed.iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{stamp}_{hex}")
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(new_id($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(
    /// One end-to-end execution of the agent loop.
    RunId,
    "run"
);
define_id!(
    /// A conversation whose history lives in one session log.
    SessionId,
    "sess"
);
define_id!(
    /// The set of tool calls proposed in one model turn.
    BatchId,
    "batch"
);
define_id!(
    /// A single tool invocation.
    CallId,
    "call"
);
define_id!(
    /// A single backend request, used to correlate errors.
    RequestId,
    "req"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_are_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert!(a.as_str().starts_with("run_"));
        assert_ne!(a, b);
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(CallId::new().as_str().starts_with("call_"));
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = new_id("x");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_id("x");
        assert!(first < second);
    }

    #[test]
    fn id_has_twelve_hex_suffix() {
        let id = BatchId::new();
        let suffix = id.as_str().rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SessionId::from("sess_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""sess_abc""#);
    }
}
