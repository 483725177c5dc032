//! Interfaces to the external collaborators the core depends on: the live
//! chain view, the presence registry and the peer transport. Consensus,
//! mempool validation and transport framing live behind these seams.

use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;
use crate::types::{Address, Block};

/// Wire codes for the typed peer requests emitted by the core. Part of the
/// protocol surface; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ProtocolCode {
    GetBlock = 11,
    GetTransaction = 12,
    GetPresence = 13,
    GetKeepAlive = 14,
    GetBlockSignature = 15,
}

/// Read access to the live chain maintained by the block processor.
pub trait ChainView: Send + Sync {
    /// Highest block number currently accepted into the chain.
    fn tip(&self) -> u64;

    /// A committed block by number.
    fn block(&self, block_num: u64) -> Option<Block>;

    /// The in-flight block currently being signed, if any. Implementations
    /// take and release the local-block lock around the read.
    fn proposer_block(&self) -> Option<Block>;

    /// Whether `block` already carries a signature from `signer`.
    fn has_signature(&self, block: &Block, signer: &Address) -> bool;
}

/// One device entry of a presence record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDevice {
    pub device: Vec<u8>,
    pub last_seen_time: i64,
}

/// Liveness record for a wallet address across its devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub address: Address,
    pub addresses: Vec<PresenceDevice>,
}

impl PresenceRecord {
    pub fn device(&self, device: &[u8]) -> Option<&PresenceDevice> {
        self.addresses.iter().find(|entry| entry.device == device)
    }
}

/// Registry of known presences.
pub trait Presence: Send + Sync {
    fn by_address(&self, address: &Address) -> Option<PresenceRecord>;
}

/// Typed message channel to a single peer.
pub trait PeerLink {
    fn send(&self, code: ProtocolCode, data: &[u8]) -> ChainResult<()>;
}
