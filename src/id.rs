//! Identifier utilities for commits and filesets.
//!
//! Both commits and filesets are named by 16 byte random identifiers,
//! rendered as fixed-length 32 character lowercase hex tokens. The fixed
//! length matters: operations that accept an id from the outside (TTL
//! renewal in particular) validate the token format strictly so a caller
//! cannot address storage it does not own via a crafted id.

use std::fmt;
use std::str::FromStr;

use hex::FromHex;
use rand::RngCore;

/// The length of an identifier in bytes.
pub const ID_LEN: usize = 16;

/// The length of an identifier rendered as a hex token.
pub const ID_HEX_LEN: usize = 32;

/// Raw byte form of an identifier.
pub type RawId = [u8; ID_LEN];

macro_rules! hex_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(RawId);

        impl $name {
            /// Creates an identifier from its raw byte form.
            pub const fn new(raw: RawId) -> Self {
                Self(raw)
            }

            /// Generates a fresh random identifier.
            pub fn random() -> Self {
                let mut raw = [0u8; ID_LEN];
                rand::thread_rng().fill_bytes(&mut raw);
                Self(raw)
            }

            /// Parses a 32 character hex token. Returns `None` when the
            /// input has the wrong length or is not valid hex.
            pub fn from_hex(token: &str) -> Option<Self> {
                if token.len() != ID_HEX_LEN {
                    return None;
                }
                let raw = <RawId as FromHex>::from_hex(token).ok()?;
                Some(Self(raw))
            }

            /// Renders the identifier as its canonical hex token.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Borrows the raw bytes of the identifier.
            pub fn as_bytes(&self) -> &RawId {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s).ok_or_else(|| ParseIdError {
                    token: s.to_string(),
                })
            }
        }
    };
}

hex_id! {
    /// Identifies one immutable fileset.
    FilesetId
}

hex_id! {
    /// Identifies one commit within a repo.
    CommitId
}

/// Error returned when a hex token cannot be parsed into an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    pub token: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid id ({})", self.token)
    }
}

impl std::error::Error for ParseIdError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_hex() {
        let id = FilesetId::random();
        let token = id.to_hex();
        assert_eq!(token.len(), ID_HEX_LEN);
        assert_eq!(FilesetId::from_hex(&token), Some(id));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(FilesetId::from_hex("abc").is_none());
        assert!(FilesetId::from_hex(&"g".repeat(ID_HEX_LEN)).is_none());
        assert!(CommitId::from_hex(&"0".repeat(ID_HEX_LEN + 2)).is_none());
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(CommitId::random(), CommitId::random());
    }
}
