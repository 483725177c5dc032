use indexmap::IndexMap;
use integer_encoding::VarInt;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

use super::{Address, Amount};

/// Version byte carried at offset 0 of every binary transaction id.
pub const TX_ID_VERSION: u8 = 1;

/// Length of the digest prefix that terminates a binary transaction id.
const TX_ID_DIGEST_LEN: usize = 8;

/// A ledger transaction as it is persisted alongside the block that
/// included it. `applied` is the number of that block; `block_height` is
/// the height the transaction declared when it was composed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub tx_type: u32,
    pub amount: Amount,
    pub fee: Amount,
    pub to_list: IndexMap<Address, Amount>,
    pub from_list: IndexMap<Address, Amount>,
    pub data_checksum: Option<Vec<u8>>,
    pub data: Option<Vec<u8>>,
    pub block_height: u64,
    pub nonce: u32,
    pub timestamp: i64,
    pub checksum: Vec<u8>,
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub applied: u64,
    pub version: u32,
}

impl Transaction {
    /// Composes a binary transaction id:
    /// `version byte | varint block_height | varint nonce | digest prefix`.
    pub fn compose_id(block_height: u64, nonce: u32, digest: &[u8]) -> Vec<u8> {
        let mut id = vec![TX_ID_VERSION];
        id.extend_from_slice(&block_height.encode_var_vec());
        id.extend_from_slice(&(nonce as u64).encode_var_vec());
        id.extend_from_slice(&digest[..digest.len().min(TX_ID_DIGEST_LEN)]);
        id
    }

    /// Reads the declared block height embedded in a binary id: a varint
    /// starting at byte offset 1.
    pub fn id_block_height(id: &[u8]) -> Option<u64> {
        if id.len() < 2 {
            return None;
        }
        u64::decode_var(&id[1..]).map(|(height, _)| height)
    }

    /// Renders a binary id in the legacy string form
    /// `"{height}-{nonce}-{base58 digest}"` used by the storage columns.
    pub fn legacy_id(id: &[u8]) -> ChainResult<String> {
        let invalid = || ChainError::Codec("malformed transaction id".into());
        if id.first() != Some(&TX_ID_VERSION) {
            return Err(invalid());
        }
        let mut offset = 1;
        let (height, read) = u64::decode_var(&id[offset..]).ok_or_else(invalid)?;
        offset += read;
        let (nonce, read) = u64::decode_var(&id[offset..]).ok_or_else(invalid)?;
        offset += read;
        let digest = &id[offset..];
        Ok(format!(
            "{height}-{nonce}-{}",
            bs58::encode(digest).into_string()
        ))
    }

    /// Converts a legacy string id back to the binary form.
    pub fn id_from_legacy(legacy: &str) -> ChainResult<Vec<u8>> {
        let invalid = || ChainError::Codec(format!("malformed legacy transaction id '{legacy}'"));
        let mut parts = legacy.splitn(3, '-');
        let height: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let nonce: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let digest = bs58::decode(parts.next().ok_or_else(invalid)?)
            .into_vec()
            .map_err(|_| invalid())?;
        Ok(Self::compose_id(height, nonce, &digest))
    }

    pub fn total_to_amount(&self) -> Amount {
        self.to_list
            .values()
            .fold(Amount::ZERO, |acc, amount| {
                acc.checked_add(amount).unwrap_or(acc)
            })
    }
}
