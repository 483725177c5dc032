use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::errors::{ChainError, ChainResult};

use super::codec::{write_i32, write_u64, ByteReader};
use super::Address;

/// One signature attached to a block. The public key is absent once a
/// block's signatures have been compacted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub pubkey: Option<Vec<u8>>,
    pub signature: Vec<u8>,
}

impl BlockSignature {
    /// Signer address derived from the public key; `None` when the key has
    /// been compacted away.
    pub fn signer_address(&self) -> Option<Address> {
        self.pubkey
            .as_deref()
            .map(crypto::address_from_pubkey)
    }
}

/// One entry of a super-block's compacted view over intermediate blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlockSegment {
    pub block_num: u64,
    pub checksum: Vec<u8>,
}

/// A block in its stored form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_num: u64,
    pub checksum: Vec<u8>,
    pub prev_checksum: Vec<u8>,
    pub wallet_state_checksum: Vec<u8>,
    pub sig_freeze_checksum: Vec<u8>,
    pub difficulty: u64,
    pub pow_field: Vec<u8>,
    /// Transaction ids in inclusion order; duplicates are never stored.
    pub tx_ids: Vec<Vec<u8>>,
    pub signatures: Vec<BlockSignature>,
    pub timestamp: i64,
    pub version: u32,
    pub last_super_block_checksum: Option<Vec<u8>>,
    pub last_super_block_num: u64,
    pub super_block_segments: Vec<SuperBlockSegment>,
    pub compacted_sigs: bool,
    pub block_proposer: Option<Vec<u8>>,
}

impl Block {
    pub fn new(block_num: u64, version: u32) -> Self {
        Self {
            block_num,
            checksum: Vec::new(),
            prev_checksum: Vec::new(),
            wallet_state_checksum: Vec::new(),
            sig_freeze_checksum: Vec::new(),
            difficulty: 0,
            pow_field: Vec::new(),
            tx_ids: Vec::new(),
            signatures: Vec::new(),
            timestamp: 0,
            version,
            last_super_block_checksum: None,
            last_super_block_num: 0,
            super_block_segments: Vec::new(),
            compacted_sigs: false,
            block_proposer: None,
        }
    }

    pub fn is_super_block(&self) -> bool {
        self.last_super_block_checksum.is_some()
    }

    /// Adds a transaction id, preserving insertion order and set semantics.
    pub fn add_tx_id(&mut self, id: Vec<u8>) -> bool {
        if self.tx_ids.iter().any(|existing| *existing == id) {
            return false;
        }
        self.tx_ids.push(id);
        true
    }

    /// Whether the block already carries a signature from `signer`.
    pub fn has_signature_from(&self, signer: &Address) -> bool {
        self.signatures
            .iter()
            .any(|sig| sig.signer_address().as_ref() == Some(signer))
    }

    /// Serializes the super-block segment list as the concatenation of
    /// `u64 num | i32 len | checksum bytes` per segment.
    pub fn encode_super_block_segments(segments: &[SuperBlockSegment]) -> Vec<u8> {
        let mut buf = Vec::new();
        for segment in segments {
            write_u64(&mut buf, segment.block_num);
            write_i32(&mut buf, segment.checksum.len() as i32);
            buf.extend_from_slice(&segment.checksum);
        }
        buf
    }

    pub fn decode_super_block_segments(data: &[u8]) -> ChainResult<Vec<SuperBlockSegment>> {
        let mut reader = ByteReader::new(data);
        let mut segments = Vec::new();
        while reader.remaining() > 0 {
            let block_num = reader.read_u64()?;
            let len = reader.read_i32()?;
            if len < 0 {
                return Err(ChainError::Codec(format!(
                    "negative segment checksum length {len}"
                )));
            }
            let checksum = reader.read_exact(len as usize)?;
            segments.push(SuperBlockSegment {
                block_num,
                checksum,
            });
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_ids_keep_set_semantics_and_order() {
        let mut block = Block::new(10, 10);
        assert!(block.add_tx_id(vec![1]));
        assert!(block.add_tx_id(vec![2]));
        assert!(!block.add_tx_id(vec![1]));
        assert_eq!(block.tx_ids, vec![vec![1], vec![2]]);
    }

    #[test]
    fn super_block_segments_round_trip() {
        let segments = vec![
            SuperBlockSegment {
                block_num: 5,
                checksum: vec![0xaa; 32],
            },
            SuperBlockSegment {
                block_num: 6,
                checksum: vec![0xbb; 32],
            },
        ];
        let encoded = Block::encode_super_block_segments(&segments);
        // each segment advances exactly 8 + 4 + len bytes
        assert_eq!(encoded.len(), 2 * (8 + 4 + 32));
        let decoded = Block::decode_super_block_segments(&encoded).expect("decode");
        assert_eq!(decoded, segments);
    }

    #[test]
    fn signature_lookup_uses_derived_address() {
        let pubkey = vec![5u8; 32];
        let signer = crypto::address_from_pubkey(&pubkey);
        let mut block = Block::new(1, 10);
        block.signatures.push(BlockSignature {
            pubkey: Some(pubkey),
            signature: vec![9u8; 64],
        });
        assert!(block.has_signature_from(&signer));
        assert!(!block.has_signature_from(&Address::from_bytes(&[1u8; 32])));
    }
}
