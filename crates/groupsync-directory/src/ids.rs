//! Directory ID types
//!
//! Newtype wrappers for the snowflake identifiers used by the directory service.
//!
//! Identifiers serialize as decimal strings (snowflakes overflow the integer range of
//! several JSON consumers) and deserialize from either a string or an integer, so
//! configuration files can use whichever form the operator copied.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Create an identifier from its raw snowflake value.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw snowflake value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Parse from a decimal string representation.
            pub fn parse(s: &str) -> Result<Self, ParseIntError> {
                Ok(Self(s.trim().parse()?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match RawId::deserialize(deserializer)? {
                    RawId::Int(raw) => Ok(Self(raw)),
                    RawId::Str(s) => Self::parse(&s).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "invalid {} '{s}': {e}",
                            stringify!($name)
                        ))
                    }),
                }
            }
        }
    };
}

/// Accepted wire forms of an identifier.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(u64),
    Str(String),
}

snowflake_id!(
    /// Account identity, stable across every directory.
    PrincipalId
);

snowflake_id!(
    /// A directory (the primary or a replica).
    DirectoryId
);

snowflake_id!(
    /// A grant (role) scoped to one directory.
    GrantId
);
