use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{ChainError, ChainResult};

mod amount;
mod block;
pub(crate) mod codec;
mod transaction;
mod wallet;

pub use amount::Amount;
pub use block::{Block, BlockSignature, SuperBlockSegment};
pub use transaction::Transaction;
pub use wallet::Wallet;

/// Canonical wallet identifier: an opaque byte string. Equality and
/// ordering are defined over the raw, unchecksummed bytes; the base58
/// rendering exists only for display and legacy storage columns.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Vec<u8>);

impl Address {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_base58(encoded: &str) -> ChainResult<Self> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|err| ChainError::Codec(format!("invalid base58 address: {err}")))?;
        Ok(Self(bytes))
    }
}

impl From<Vec<u8>> for Address {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_base58())
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Address::from_base58(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_by_raw_bytes() {
        let a = Address::from_bytes(&[1, 2]);
        let b = Address::from_bytes(&[1, 3]);
        let c = Address::from_bytes(&[1, 2, 0]);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn base58_round_trip() {
        let addr = Address::from_bytes(&[0, 17, 255, 3]);
        let encoded = addr.to_base58();
        assert_eq!(Address::from_base58(&encoded).expect("decode"), addr);
    }
}
