use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::constants::{DISCOVERY_KEY_CONTEXT, KEY_LENGTH};
use crate::ProtocolError;

/// Generates a fixed-length opaque key type.
///
/// Keys compare by their raw bytes, which is the same order as comparing
/// their lowercase hex strings. Swarms rely on that order for tie-breaks.
macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; KEY_LENGTH]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Generate a uniformly random key.
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
                let key: [u8; KEY_LENGTH] = bytes
                    .try_into()
                    .map_err(|_| ProtocolError::InvalidKeyLength(bytes.len()))?;
                Ok(Self(key))
            }

            pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
                let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
                Self::from_slice(&bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First four bytes in hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl From<[u8; KEY_LENGTH]> for $name {
            fn from(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_key!(
    /// Rendezvous key identifying one logical swarm.
    Topic
);

define_key!(
    /// Identifier of a participant within a topic.
    PeerId
);

define_key!(
    /// Scope of one connection attempt's signaling exchange, minted by the initiator.
    SessionId
);

impl Topic {
    /// Channel key handed to the application protocol for this topic.
    ///
    /// Hashing keeps the raw topic off the wire of the application stream.
    pub fn discovery_key(&self) -> [u8; KEY_LENGTH] {
        let mut hasher = Sha256::new();
        hasher.update(DISCOVERY_KEY_CONTEXT);
        hasher.update(self.0);
        hasher.finalize().into()
    }
}

impl PeerId {
    /// XOR distance between two peer ids.
    pub fn distance(&self, other: &PeerId) -> Distance {
        let mut out = [0u8; KEY_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

/// XOR metric between two keys, ordered as a big-endian unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; KEY_LENGTH]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; KEY_LENGTH]);

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

/// Sort peers by ascending XOR distance from `reference`.
pub fn sort_by_distance(peers: &mut [PeerId], reference: &PeerId) {
    peers.sort_by_key(|peer| peer.distance(reference));
}
