//! Identifier newtypes for codebases, sandboxes, and sessions.
//!
//! Follows the teacher's `BoxID`/`ContainerID` pattern (`runtime/types.rs`):
//! a thin wrapper around a `String`, with `parse`/`is_valid`, `Display`, a
//! truncated `Debug`, and `Serialize`/`Deserialize`. Unlike the teacher's
//! ULID-based `BoxID`, spec §6 fixes the wire format to a prefix plus 16 hex
//! characters, so generation goes through `rand` + `hex` rather than `ulid`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const HEX_LEN: usize = 16;

fn new_hex_suffix() -> String {
    let mut bytes = [0u8; HEX_LEN / 2];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_valid_with_prefix(s: &str, prefix: &str) -> bool {
    match s.strip_prefix(prefix) {
        Some(rest) => {
            rest.len() == HEX_LEN && rest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
        }
        None => false,
    }
}

macro_rules! id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix every value of this identifier type starts with.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(format!("{}{}", $prefix, new_hex_suffix()))
            }

            /// Parse an existing string as this identifier type.
            ///
            /// Returns `None` if the string doesn't match `<prefix><16 hex chars>`.
            pub fn parse(s: &str) -> Option<Self> {
                if Self::is_valid(s) {
                    Some(Self(s.to_string()))
                } else {
                    None
                }
            }

            /// Check if a string is a validly formatted identifier of this type.
            pub fn is_valid(s: &str) -> bool {
                is_valid_with_prefix(s, $prefix)
            }

            /// Borrow the full identifier string.
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
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type!(CodebaseId, "cb_", "Opaque identifier for a codebase (`cb_<16 hex chars>`).");
id_type!(SandboxId, "sb_", "Opaque identifier for a sandbox (`sb_<16 hex chars>`).");
id_type!(SessionId, "sess_", "Opaque identifier for a shell session (`sess_<16 hex chars>`).");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_expected_format() {
        let id = SandboxId::new();
        assert!(id.as_str().starts_with("sb_"));
        assert_eq!(id.as_str().len(), 3 + 16);
        assert!(SandboxId::is_valid(id.as_str()));
    }

    #[test]
    fn rejects_wrong_prefix_and_length() {
        assert!(SandboxId::parse("cb_0123456789abcdef").is_none());
        assert!(SandboxId::parse("sb_0123").is_none());
        assert!(SandboxId::parse("sb_0123456789ABCDEF").is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(CodebaseId::new(), CodebaseId::new());
    }

    #[test]
    fn session_prefix_is_distinct() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"));
    }

    #[test]
    fn debug_contains_type_name() {
        let id = CodebaseId::new();
        let debug = format!("{:?}", id);
        assert!(debug.starts_with("CodebaseId("));
    }
}
