//! Inventory reconciliation.
//!
//! Peers advertise lightweight inventory items; the reconciler decides, per
//! item and against the live chain tip, whether a concrete object has to be
//! requested from the advertising peer. Decisions never fail: a malformed
//! or uninteresting advertisement is simply not handled.

use std::sync::Arc;

use integer_encoding::VarInt;
use tracing::{debug, warn};

use crate::interfaces::{ChainView, PeerLink, Presence, ProtocolCode};
use crate::types::Address;

/// How far behind the tip a block signature advertisement is still
/// serviceable.
const SIGNATURE_WINDOW: u64 = 5;

/// A peer-supplied hint about an object the peer possesses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InventoryItem {
    Block {
        block_num: u64,
    },
    BlockSignature {
        block_num: u64,
        block_checksum: Vec<u8>,
        signer: Address,
    },
    KeepAlive {
        address: Address,
        device: Vec<u8>,
        last_seen: i64,
    },
    Transaction {
        id: Vec<u8>,
    },
}

/// Decides which advertised objects to fetch, reading chain state through
/// the injected collaborator handles.
pub struct InventoryReconciler<C, P> {
    chain: Arc<C>,
    presence: Arc<P>,
    /// Master nodes request catch-up blocks without transaction payloads.
    node_master: bool,
}

impl<C: ChainView, P: Presence> InventoryReconciler<C, P> {
    pub fn new(chain: Arc<C>, presence: Arc<P>, node_master: bool) -> Self {
        Self {
            chain,
            presence,
            node_master,
        }
    }

    /// Processes one advertisement; returns whether a fetch was emitted.
    pub fn reconcile(&self, item: &InventoryItem, peer: &dyn PeerLink) -> bool {
        match item {
            InventoryItem::Block { block_num } => self.reconcile_block(*block_num, peer),
            InventoryItem::BlockSignature {
                block_num,
                block_checksum,
                signer,
            } => self.reconcile_signature(*block_num, block_checksum, signer, peer),
            InventoryItem::KeepAlive {
                address,
                device,
                last_seen,
            } => self.reconcile_keep_alive(address, device, *last_seen, peer),
            InventoryItem::Transaction { id } => self.reconcile_transaction(id, peer),
        }
    }

    fn reconcile_block(&self, block_num: u64, peer: &dyn PeerLink) -> bool {
        let tip = self.chain.tip();
        if block_num <= tip {
            return false;
        }
        let include_tx = if self.node_master { 0 } else { 2 };
        let payload = get_block_request(tip + 1, None, include_tx, true);
        self.emit(peer, ProtocolCode::GetBlock, &payload)
    }

    fn reconcile_signature(
        &self,
        block_num: u64,
        block_checksum: &[u8],
        signer: &Address,
        peer: &dyn PeerLink,
    ) -> bool {
        let tip = self.chain.tip();
        // only signatures for recent blocks or the block being signed
        if block_num + SIGNATURE_WINDOW <= tip || block_num > tip + 1 {
            return false;
        }
        let local = if block_num == tip + 1 {
            self.chain.proposer_block()
        } else {
            self.chain.block(block_num)
        };
        let Some(local) = local else {
            return false;
        };
        if local.checksum != block_checksum {
            // the peer is advertising a fork we cannot service
            debug!(
                block_num,
                advertised = %hex::encode(block_checksum),
                "signature advertisement for unknown fork"
            );
            return false;
        }
        if self.chain.has_signature(&local, signer) {
            return false;
        }
        let payload = get_block_signature_request(block_num, signer);
        self.emit(peer, ProtocolCode::GetBlockSignature, &payload)
    }

    fn reconcile_keep_alive(
        &self,
        address: &Address,
        device: &[u8],
        last_seen: i64,
        peer: &dyn PeerLink,
    ) -> bool {
        match self.presence.by_address(address) {
            None => {
                let payload = get_presence_request(address);
                self.emit(peer, ProtocolCode::GetPresence, &payload)
            }
            Some(record) => {
                let outdated = match record.device(device) {
                    None => true,
                    Some(entry) => entry.last_seen_time < last_seen,
                };
                if !outdated {
                    return false;
                }
                let payload = get_keep_alive_request(address, device);
                self.emit(peer, ProtocolCode::GetKeepAlive, &payload)
            }
        }
    }

    fn reconcile_transaction(&self, id: &[u8], peer: &dyn PeerLink) -> bool {
        let payload = match get_transaction_request(id) {
            Some(payload) => payload,
            None => return false,
        };
        self.emit(peer, ProtocolCode::GetTransaction, &payload)
    }

    fn emit(&self, peer: &dyn PeerLink, code: ProtocolCode, payload: &[u8]) -> bool {
        match peer.send(code, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, ?code, "failed to send inventory request");
                false
            }
        }
    }
}

// --- request payloads -------------------------------------------------------
//
// Length-prefixed concatenations of varints and byte strings; the formats
// are part of the peer protocol and fixed.

/// `varint(next_height) | endpoint marker/bytes | u8 include_tx | bool latest_only`.
pub fn get_block_request(
    next_height: u64,
    endpoint: Option<&[u8]>,
    include_tx: u8,
    latest_only: bool,
) -> Vec<u8> {
    let mut payload = next_height.encode_var_vec();
    match endpoint {
        Some(endpoint) => {
            payload.push(1);
            payload.extend_from_slice(&(endpoint.len() as u64).encode_var_vec());
            payload.extend_from_slice(endpoint);
        }
        None => payload.push(0),
    }
    payload.push(include_tx);
    payload.push(u8::from(latest_only));
    payload
}

/// `string(legacy_tx_id) | u64(0)`.
pub fn get_transaction_request(id: &[u8]) -> Option<Vec<u8>> {
    let legacy = match crate::types::Transaction::legacy_id(id) {
        Ok(legacy) => legacy,
        Err(err) => {
            warn!(%err, "advertised transaction id is malformed");
            return None;
        }
    };
    let mut payload = (legacy.len() as u64).encode_var_vec();
    payload.extend_from_slice(legacy.as_bytes());
    payload.extend_from_slice(&0u64.to_le_bytes());
    Some(payload)
}

/// `i32 addr_len | addr bytes`.
pub fn get_presence_request(address: &Address) -> Vec<u8> {
    let mut payload = (address.as_bytes().len() as i32).to_le_bytes().to_vec();
    payload.extend_from_slice(address.as_bytes());
    payload
}

/// `varint(addr_len) | addr | varint(device_len) | device`.
pub fn get_keep_alive_request(address: &Address, device: &[u8]) -> Vec<u8> {
    let mut payload = (address.as_bytes().len() as u64).encode_var_vec();
    payload.extend_from_slice(address.as_bytes());
    payload.extend_from_slice(&(device.len() as u64).encode_var_vec());
    payload.extend_from_slice(device);
    payload
}

/// `varint(block_num) | varint(addr_len) | addr`.
pub fn get_block_signature_request(block_num: u64, signer: &Address) -> Vec<u8> {
    let mut payload = block_num.encode_var_vec();
    payload.extend_from_slice(&(signer.as_bytes().len() as u64).encode_var_vec());
    payload.extend_from_slice(signer.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::errors::ChainResult;
    use crate::interfaces::{PresenceDevice, PresenceRecord};
    use crate::types::{Block, BlockSignature, Transaction};
    use parking_lot::Mutex;

    fn addr(byte: u8) -> Address {
        Address::from_bytes(&[byte; 20])
    }

    #[derive(Default)]
    struct FakeChain {
        tip: u64,
        blocks: Vec<Block>,
        proposer: Option<Block>,
    }

    impl ChainView for FakeChain {
        fn tip(&self) -> u64 {
            self.tip
        }

        fn block(&self, block_num: u64) -> Option<Block> {
            self.blocks
                .iter()
                .find(|block| block.block_num == block_num)
                .cloned()
        }

        fn proposer_block(&self) -> Option<Block> {
            self.proposer.clone()
        }

        fn has_signature(&self, block: &Block, signer: &Address) -> bool {
            block.has_signature_from(signer)
        }
    }

    #[derive(Default)]
    struct FakePresence {
        records: Vec<PresenceRecord>,
    }

    impl Presence for FakePresence {
        fn by_address(&self, address: &Address) -> Option<PresenceRecord> {
            self.records
                .iter()
                .find(|record| &record.address == address)
                .cloned()
        }
    }

    #[derive(Default)]
    struct RecordingPeer {
        sent: Mutex<Vec<(ProtocolCode, Vec<u8>)>>,
    }

    impl PeerLink for RecordingPeer {
        fn send(&self, code: ProtocolCode, data: &[u8]) -> ChainResult<()> {
            self.sent.lock().push((code, data.to_vec()));
            Ok(())
        }
    }

    fn reconciler(
        chain: FakeChain,
        presence: FakePresence,
        master: bool,
    ) -> InventoryReconciler<FakeChain, FakePresence> {
        InventoryReconciler::new(Arc::new(chain), Arc::new(presence), master)
    }

    #[test]
    fn known_blocks_are_not_fetched() {
        let chain = FakeChain {
            tip: 50,
            ..Default::default()
        };
        let peer = RecordingPeer::default();
        let handled = reconciler(chain, FakePresence::default(), false)
            .reconcile(&InventoryItem::Block { block_num: 40 }, &peer);
        assert!(!handled);
        assert!(peer.sent.lock().is_empty());
    }

    #[test]
    fn ahead_blocks_request_the_next_height() {
        let chain = FakeChain {
            tip: 50,
            ..Default::default()
        };
        let peer = RecordingPeer::default();
        let handled = reconciler(chain, FakePresence::default(), false)
            .reconcile(&InventoryItem::Block { block_num: 60 }, &peer);
        assert!(handled);

        let sent = peer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ProtocolCode::GetBlock);
        assert_eq!(sent[0].1, get_block_request(51, None, 2, true));
    }

    #[test]
    fn master_nodes_request_blocks_without_transactions() {
        let chain = FakeChain {
            tip: 50,
            ..Default::default()
        };
        let peer = RecordingPeer::default();
        assert!(reconciler(chain, FakePresence::default(), true)
            .reconcile(&InventoryItem::Block { block_num: 51 }, &peer));
        let sent = peer.sent.lock();
        assert_eq!(sent[0].1, get_block_request(51, None, 0, true));
    }

    #[test]
    fn transactions_are_always_fetched() {
        let peer = RecordingPeer::default();
        let id = Transaction::compose_id(9, 1, &[4u8; 8]);
        assert!(reconciler(FakeChain::default(), FakePresence::default(), false)
            .reconcile(&InventoryItem::Transaction { id: id.clone() }, &peer));
        let sent = peer.sent.lock();
        assert_eq!(sent[0].0, ProtocolCode::GetTransaction);
        assert_eq!(sent[0].1, get_transaction_request(&id).expect("payload"));
    }

    #[test]
    fn unknown_presence_requests_the_full_record() {
        let peer = RecordingPeer::default();
        let handled = reconciler(FakeChain::default(), FakePresence::default(), false).reconcile(
            &InventoryItem::KeepAlive {
                address: addr(1),
                device: b"dev".to_vec(),
                last_seen: 100,
            },
            &peer,
        );
        assert!(handled);
        let sent = peer.sent.lock();
        assert_eq!(sent[0].0, ProtocolCode::GetPresence);
        assert_eq!(sent[0].1, get_presence_request(&addr(1)));
    }

    #[test]
    fn newer_keep_alive_is_fetched_and_older_is_not() {
        let presence = FakePresence {
            records: vec![PresenceRecord {
                address: addr(1),
                addresses: vec![PresenceDevice {
                    device: b"dev".to_vec(),
                    last_seen_time: 100,
                }],
            }],
        };
        let reconciler = reconciler(FakeChain::default(), presence, false);

        let peer = RecordingPeer::default();
        assert!(reconciler.reconcile(
            &InventoryItem::KeepAlive {
                address: addr(1),
                device: b"dev".to_vec(),
                last_seen: 150,
            },
            &peer,
        ));
        assert_eq!(peer.sent.lock()[0].0, ProtocolCode::GetKeepAlive);

        let quiet_peer = RecordingPeer::default();
        assert!(!reconciler.reconcile(
            &InventoryItem::KeepAlive {
                address: addr(1),
                device: b"dev".to_vec(),
                last_seen: 50,
            },
            &quiet_peer,
        ));
        assert!(quiet_peer.sent.lock().is_empty());
    }

    #[test]
    fn unknown_devices_refresh_the_keep_alive() {
        let presence = FakePresence {
            records: vec![PresenceRecord {
                address: addr(1),
                addresses: vec![PresenceDevice {
                    device: b"dev".to_vec(),
                    last_seen_time: 100,
                }],
            }],
        };
        let peer = RecordingPeer::default();
        assert!(reconciler(FakeChain::default(), presence, false).reconcile(
            &InventoryItem::KeepAlive {
                address: addr(1),
                device: b"other".to_vec(),
                last_seen: 10,
            },
            &peer,
        ));
        assert_eq!(peer.sent.lock()[0].0, ProtocolCode::GetKeepAlive);
    }

    fn signed_block(block_num: u64, signer_key: &[u8]) -> Block {
        let mut block = Block::new(block_num, 10);
        block.checksum = crypto::hash(&block_num.to_le_bytes());
        block.signatures.push(BlockSignature {
            pubkey: Some(signer_key.to_vec()),
            signature: vec![1u8; 64],
        });
        block
    }

    #[test]
    fn missing_signature_inside_window_is_fetched() {
        let block = signed_block(48, &[2u8; 32]);
        let checksum = block.checksum.clone();
        let chain = FakeChain {
            tip: 50,
            blocks: vec![block],
            proposer: None,
        };
        let peer = RecordingPeer::default();
        let handled = reconciler(chain, FakePresence::default(), false).reconcile(
            &InventoryItem::BlockSignature {
                block_num: 48,
                block_checksum: checksum,
                signer: addr(9),
            },
            &peer,
        );
        assert!(handled);
        let sent = peer.sent.lock();
        assert_eq!(sent[0].0, ProtocolCode::GetBlockSignature);
        assert_eq!(sent[0].1, get_block_signature_request(48, &addr(9)));
    }

    #[test]
    fn known_signature_is_not_refetched() {
        let signer_key = vec![2u8; 32];
        let signer = crypto::address_from_pubkey(&signer_key);
        let block = signed_block(49, &signer_key);
        let checksum = block.checksum.clone();
        let chain = FakeChain {
            tip: 50,
            blocks: vec![block],
            proposer: None,
        };
        let peer = RecordingPeer::default();
        assert!(!reconciler(chain, FakePresence::default(), false).reconcile(
            &InventoryItem::BlockSignature {
                block_num: 49,
                block_checksum: checksum,
                signer,
            },
            &peer,
        ));
    }

    #[test]
    fn signatures_outside_the_window_are_ignored() {
        let chain = FakeChain {
            tip: 50,
            ..Default::default()
        };
        let reconciler = reconciler(chain, FakePresence::default(), false);
        let peer = RecordingPeer::default();
        for block_num in [45, 52] {
            assert!(!reconciler.reconcile(
                &InventoryItem::BlockSignature {
                    block_num,
                    block_checksum: vec![0u8; 32],
                    signer: addr(1),
                },
                &peer,
            ));
        }
        assert!(peer.sent.lock().is_empty());
    }

    #[test]
    fn forked_checksum_declines_the_fetch() {
        let block = signed_block(50, &[2u8; 32]);
        let chain = FakeChain {
            tip: 50,
            blocks: vec![block],
            proposer: None,
        };
        let peer = RecordingPeer::default();
        assert!(!reconciler(chain, FakePresence::default(), false).reconcile(
            &InventoryItem::BlockSignature {
                block_num: 50,
                block_checksum: vec![0xde; 32],
                signer: addr(1),
            },
            &peer,
        ));
    }

    #[test]
    fn tip_plus_one_consults_the_proposer_block() {
        let proposer = signed_block(51, &[2u8; 32]);
        let checksum = proposer.checksum.clone();
        let chain = FakeChain {
            tip: 50,
            blocks: Vec::new(),
            proposer: Some(proposer),
        };
        let peer = RecordingPeer::default();
        assert!(reconciler(chain, FakePresence::default(), false).reconcile(
            &InventoryItem::BlockSignature {
                block_num: 51,
                block_checksum: checksum,
                signer: addr(9),
            },
            &peer,
        ));
        assert_eq!(peer.sent.lock()[0].1, get_block_signature_request(51, &addr(9)));
    }

    #[test]
    fn request_payloads_have_fixed_layouts() {
        let payload = get_block_request(300, None, 2, true);
        let (height, read) = u64::decode_var(&payload).expect("varint");
        assert_eq!(height, 300);
        assert_eq!(&payload[read..], &[0, 2, 1]);

        let addr = addr(3);
        let payload = get_keep_alive_request(&addr, b"dev");
        let (addr_len, read) = u64::decode_var(&payload).expect("varint");
        assert_eq!(addr_len, 20);
        assert_eq!(&payload[read..read + 20], addr.as_bytes());

        let payload = get_presence_request(&addr);
        assert_eq!(&payload[..4], &20i32.to_le_bytes());
    }
}
