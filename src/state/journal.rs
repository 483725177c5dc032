//! Reversible journal of wallet-state mutations.
//!
//! Every mutation performed while applying a block is captured as a
//! [`JournalEntry`] before it takes effect; entries are grouped into a
//! [`JournalTransaction`] that applies forward and reverts in reverse
//! insertion order. Each entry stores enough prior state to reverse itself
//! without consulting other entries.

use parking_lot::Mutex;
use tracing::warn;

use crate::crypto;
use crate::errors::{ChainError, ChainResult};
use crate::types::codec::{write_bool, write_bytes, write_i32, write_opt_bytes, write_u64, ByteReader};
use crate::types::{Address, Amount, Wallet};

use super::Wallets;

/// First block version whose affected-wallet list preserves first-occurrence
/// order instead of sorting by address bytes.
pub const BLOCK_VERSION_ORDERED_WALLETS: u32 = 10;

// Wire discriminants. Part of the persisted format; never renumber.
const TAG_BALANCE: i32 = 1;
const TAG_ALLOWED_SIGNER: i32 = 2;
const TAG_REQUIRED_SIGNATURES: i32 = 3;
const TAG_PUBKEY: i32 = 4;
const TAG_DATA: i32 = 5;
const TAG_CREATE: i32 = 6;
const TAG_DESTROY: i32 = 7;

/// A single reversible wallet-state mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    Balance {
        target: Address,
        old: Amount,
        new: Amount,
    },
    AllowedSigner {
        target: Address,
        signer: Address,
        adding: bool,
        /// Only meaningful (and only written) when `adding` is false.
        adjust_signers: bool,
    },
    RequiredSignatures {
        target: Address,
        old: u8,
        new: u8,
    },
    Pubkey {
        target: Address,
        pubkey: Vec<u8>,
    },
    Data {
        target: Address,
        new: Option<Vec<u8>>,
        old: Option<Vec<u8>>,
    },
    Create {
        target: Address,
    },
    Destroy {
        target: Address,
        wallet: Wallet,
    },
}

impl JournalEntry {
    pub fn tag(&self) -> i32 {
        match self {
            JournalEntry::Balance { .. } => TAG_BALANCE,
            JournalEntry::AllowedSigner { .. } => TAG_ALLOWED_SIGNER,
            JournalEntry::RequiredSignatures { .. } => TAG_REQUIRED_SIGNATURES,
            JournalEntry::Pubkey { .. } => TAG_PUBKEY,
            JournalEntry::Data { .. } => TAG_DATA,
            JournalEntry::Create { .. } => TAG_CREATE,
            JournalEntry::Destroy { .. } => TAG_DESTROY,
        }
    }

    pub fn target(&self) -> &Address {
        match self {
            JournalEntry::Balance { target, .. }
            | JournalEntry::AllowedSigner { target, .. }
            | JournalEntry::RequiredSignatures { target, .. }
            | JournalEntry::Pubkey { target, .. }
            | JournalEntry::Data { target, .. }
            | JournalEntry::Create { target }
            | JournalEntry::Destroy { target, .. } => target,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_i32(&mut buf, self.tag());
        match self {
            JournalEntry::Balance { target, old, new } => {
                write_bytes(&mut buf, target.as_bytes());
                write_bytes(&mut buf, old.to_string().as_bytes());
                write_bytes(&mut buf, new.to_string().as_bytes());
            }
            JournalEntry::AllowedSigner {
                target,
                signer,
                adding,
                adjust_signers,
            } => {
                write_bytes(&mut buf, target.as_bytes());
                write_bytes(&mut buf, signer.as_bytes());
                write_bool(&mut buf, *adding);
                if !adding {
                    write_bool(&mut buf, *adjust_signers);
                }
            }
            JournalEntry::RequiredSignatures { target, old, new } => {
                write_bytes(&mut buf, target.as_bytes());
                buf.push(*old);
                buf.push(*new);
            }
            JournalEntry::Pubkey { target, pubkey } => {
                write_bytes(&mut buf, target.as_bytes());
                write_bytes(&mut buf, pubkey);
            }
            JournalEntry::Data { target, new, old } => {
                write_bytes(&mut buf, target.as_bytes());
                // new before old; the decoder matches this order
                write_opt_bytes(&mut buf, new.as_deref());
                write_opt_bytes(&mut buf, old.as_deref());
            }
            JournalEntry::Create { target } => {
                write_bytes(&mut buf, target.as_bytes());
            }
            JournalEntry::Destroy { target, wallet } => {
                write_bytes(&mut buf, target.as_bytes());
                write_bytes(&mut buf, &wallet.to_bytes());
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        Self::read_from(&mut reader)
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let tag = reader.read_i32()?;
        match tag {
            TAG_BALANCE => {
                let target = Address::from(reader.read_bytes()?);
                let old: Amount = String::from_utf8_lossy(&reader.read_bytes()?).parse()?;
                let new: Amount = String::from_utf8_lossy(&reader.read_bytes()?).parse()?;
                Ok(JournalEntry::Balance { target, old, new })
            }
            TAG_ALLOWED_SIGNER => {
                let target = Address::from(reader.read_bytes()?);
                let signer = Address::from(reader.read_bytes()?);
                let adding = reader.read_bool()?;
                let adjust_signers = if adding { false } else { reader.read_bool()? };
                Ok(JournalEntry::AllowedSigner {
                    target,
                    signer,
                    adding,
                    adjust_signers,
                })
            }
            TAG_REQUIRED_SIGNATURES => {
                let target = Address::from(reader.read_bytes()?);
                let old = reader.read_u8()?;
                let new = reader.read_u8()?;
                Ok(JournalEntry::RequiredSignatures { target, old, new })
            }
            TAG_PUBKEY => {
                let target = Address::from(reader.read_bytes()?);
                let pubkey = reader.read_bytes()?;
                Ok(JournalEntry::Pubkey { target, pubkey })
            }
            TAG_DATA => {
                let target = Address::from(reader.read_bytes()?);
                let new = reader.read_opt_bytes()?;
                let old = reader.read_opt_bytes()?;
                Ok(JournalEntry::Data { target, new, old })
            }
            TAG_CREATE => {
                let target = Address::from(reader.read_bytes()?);
                Ok(JournalEntry::Create { target })
            }
            TAG_DESTROY => {
                let target = Address::from(reader.read_bytes()?);
                let wallet = Wallet::from_bytes(&reader.read_bytes()?)?;
                Ok(JournalEntry::Destroy { target, wallet })
            }
            other => Err(ChainError::Codec(format!(
                "unknown journal entry tag {other}"
            ))),
        }
    }

    pub fn checksum(&self) -> Vec<u8> {
        crypto::hash(&self.to_bytes())
    }

    pub(crate) fn apply(&self, wallets: &mut Wallets) -> bool {
        match self {
            JournalEntry::Balance { target, new, .. } => {
                wallets.set_balance_internal(target, new, false)
            }
            JournalEntry::AllowedSigner {
                target,
                signer,
                adding: true,
                ..
            } => wallets.add_allowed_signer_internal(target, signer, false, false),
            JournalEntry::AllowedSigner {
                target,
                signer,
                adding: false,
                adjust_signers,
            } => wallets.remove_allowed_signer_internal(target, signer, *adjust_signers, false),
            JournalEntry::RequiredSignatures { target, new, .. } => {
                wallets.set_required_signatures_internal(target, *new)
            }
            JournalEntry::Pubkey { target, pubkey } => {
                wallets.set_pubkey_internal(target, Some(pubkey), false)
            }
            JournalEntry::Data { target, new, old } => {
                wallets.set_user_data_internal(target, new.as_deref(), old.as_deref())
            }
            // the wallet was already created by the caller
            JournalEntry::Create { .. } => true,
            JournalEntry::Destroy { target, .. } => wallets.remove_wallet_internal(target),
        }
    }

    pub(crate) fn revert(&self, wallets: &mut Wallets) -> bool {
        match self {
            JournalEntry::Balance { target, old, .. } => {
                wallets.set_balance_internal(target, old, true)
            }
            JournalEntry::AllowedSigner {
                target,
                signer,
                adding: true,
                ..
            } => wallets.remove_allowed_signer_internal(target, signer, false, true),
            JournalEntry::AllowedSigner {
                target,
                signer,
                adding: false,
                adjust_signers,
            } => wallets.add_allowed_signer_internal(target, signer, *adjust_signers, true),
            JournalEntry::RequiredSignatures { target, old, .. } => {
                wallets.set_required_signatures_internal(target, *old)
            }
            JournalEntry::Pubkey { target, .. } => wallets.set_pubkey_internal(target, None, true),
            JournalEntry::Data { target, new, old } => {
                wallets.set_user_data_internal(target, old.as_deref(), new.as_deref())
            }
            // the wallet may already be gone if a later balance entry
            // pruned it back to empty
            JournalEntry::Create { target } => {
                wallets.wallet(target).is_none() || wallets.remove_wallet_internal(target)
            }
            JournalEntry::Destroy { target, wallet } => {
                wallets.set_wallet_internal(target, wallet.clone())
            }
        }
    }
}

/// Ordered batch of journal entries with a caller-assigned number.
///
/// The entry list is guarded internally, but the caller is expected to hold
/// an exclusive lock around the whole transaction while applying or
/// reverting it.
#[derive(Debug, Default)]
pub struct JournalTransaction {
    number: u64,
    entries: Mutex<Vec<JournalEntry>>,
}

impl JournalTransaction {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn append(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Applies all entries in insertion order. Stops at the first failure
    /// and returns `false` without reverting; the caller must revert the
    /// partially applied transaction.
    pub fn apply(&self, wallets: &mut Wallets) -> bool {
        let entries = self.entries.lock();
        for (index, entry) in entries.iter().enumerate() {
            if !entry.apply(wallets) {
                warn!(
                    number = self.number,
                    index,
                    tag = entry.tag(),
                    target_wallet = %entry.target(),
                    "journal entry failed to apply"
                );
                return false;
            }
        }
        true
    }

    /// Reverts all entries in reverse insertion order. Individual failures
    /// are logged and skipped; the revert always runs to completion.
    pub fn revert(&self, wallets: &mut Wallets) -> bool {
        let entries = self.entries.lock();
        for (index, entry) in entries.iter().enumerate().rev() {
            if !entry.revert(wallets) {
                warn!(
                    number = self.number,
                    index,
                    tag = entry.tag(),
                    target_wallet = %entry.target(),
                    "journal entry failed to revert"
                );
            }
        }
        true
    }

    /// Distinct target wallets of this transaction. Blocks before version
    /// [`BLOCK_VERSION_ORDERED_WALLETS`] sort the result by address bytes;
    /// later blocks preserve first-occurrence order. The result feeds
    /// wallet-state checksums, so the mode must match the block's declared
    /// version.
    pub fn affected_wallets(&self, block_version: u32) -> Vec<Address> {
        if block_version >= BLOCK_VERSION_ORDERED_WALLETS {
            self.affected_wallets_ordered()
        } else {
            self.affected_wallets_sorted()
        }
    }

    fn affected_wallets_sorted(&self) -> Vec<Address> {
        let entries = self.entries.lock();
        let mut targets: Vec<Address> = entries.iter().map(|e| e.target().clone()).collect();
        targets.sort();
        targets.dedup();
        targets
    }

    fn affected_wallets_ordered(&self) -> Vec<Address> {
        let entries = self.entries.lock();
        let mut targets = Vec::new();
        for entry in entries.iter() {
            if !targets.contains(entry.target()) {
                targets.push(entry.target().clone());
            }
        }
        targets
    }

    /// Binary layout: `u64 number | i32 count | entry bytes…`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = self.entries.lock();
        let mut buf = Vec::new();
        write_u64(&mut buf, self.number);
        write_i32(&mut buf, entries.len() as i32);
        for entry in entries.iter() {
            buf.extend_from_slice(&entry.to_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let number = reader.read_u64()?;
        let count = reader.read_i32()?;
        if count < 0 {
            return Err(ChainError::Codec(format!("negative entry count {count}")));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            // dispatch on the peeked tag, then let the entry decoder
            // consume it again
            let tag = reader.read_i32()?;
            reader.rewind(4);
            if !(TAG_BALANCE..=TAG_DESTROY).contains(&tag) {
                return Err(ChainError::Codec(format!(
                    "unknown journal entry tag {tag}"
                )));
            }
            entries.push(JournalEntry::read_from(&mut reader)?);
        }
        Ok(Self {
            number,
            entries: Mutex::new(entries),
        })
    }
}

impl Clone for JournalTransaction {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            entries: Mutex::new(self.entries.lock().clone()),
        }
    }
}

impl PartialEq for JournalTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && *self.entries.lock() == *other.entries.lock()
    }
}

impl Eq for JournalTransaction {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WalletState;

    fn addr(byte: u8) -> Address {
        Address::from_bytes(&[byte; 20])
    }

    fn sample_entries() -> Vec<JournalEntry> {
        let mut wallet = Wallet::new(addr(9));
        wallet.balance = Amount::from_whole(3);
        vec![
            JournalEntry::Balance {
                target: addr(1),
                old: Amount::from_whole(100),
                new: Amount::from_whole(40),
            },
            JournalEntry::AllowedSigner {
                target: addr(2),
                signer: addr(3),
                adding: true,
                adjust_signers: false,
            },
            JournalEntry::AllowedSigner {
                target: addr(2),
                signer: addr(4),
                adding: false,
                adjust_signers: true,
            },
            JournalEntry::RequiredSignatures {
                target: addr(2),
                old: 2,
                new: 3,
            },
            JournalEntry::Pubkey {
                target: addr(5),
                pubkey: vec![7u8; 44],
            },
            JournalEntry::Data {
                target: addr(6),
                new: Some(b"new".to_vec()),
                old: None,
            },
            JournalEntry::Create { target: addr(8) },
            JournalEntry::Destroy {
                target: addr(9),
                wallet,
            },
        ]
    }

    #[test]
    fn every_entry_variant_round_trips() {
        for entry in sample_entries() {
            let decoded = JournalEntry::from_bytes(&entry.to_bytes()).expect("decode");
            assert_eq!(decoded, entry, "tag {}", entry.tag());
        }
    }

    #[test]
    fn transaction_round_trips_with_number_and_order() {
        let journal = JournalTransaction::new(77);
        for entry in sample_entries() {
            journal.append(entry);
        }
        let decoded = JournalTransaction::from_bytes(&journal.to_bytes()).expect("decode");
        assert_eq!(decoded, journal);
        assert_eq!(decoded.number(), 77);
    }

    #[test]
    fn unknown_tag_aborts_decoding() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 1);
        write_i32(&mut buf, 1);
        write_i32(&mut buf, 99);
        assert!(JournalTransaction::from_bytes(&buf).is_err());
    }

    #[test]
    fn entry_checksum_is_stable() {
        let entry = JournalEntry::Create { target: addr(1) };
        assert_eq!(entry.checksum(), entry.checksum());
        assert_eq!(entry.checksum().len(), crate::crypto::HASH_LEN);
    }

    #[test]
    fn apply_then_revert_restores_balances() {
        let state = WalletState::new();
        state.begin_transaction(1).expect("begin");
        state
            .set_balance(&addr(1), Amount::from_whole(100))
            .expect("seed");
        state.commit_transaction().expect("commit");
        let before = state.state_checksum();

        let journal = JournalTransaction::new(2);
        journal.append(JournalEntry::Balance {
            target: addr(1),
            old: Amount::from_whole(100),
            new: Amount::from_whole(40),
        });
        journal.append(JournalEntry::Balance {
            target: addr(1),
            old: Amount::from_whole(40),
            new: Amount::from_whole(55),
        });
        assert!(state.apply_journal(&journal));
        assert_eq!(state.balance(&addr(1)), Amount::from_whole(55));

        assert!(state.revert_journal(&journal));
        assert_eq!(state.balance(&addr(1)), Amount::from_whole(100));
        assert_eq!(state.state_checksum(), before);
    }

    #[test]
    fn destroy_and_create_pair_reverts_cleanly() {
        let state = WalletState::new();
        state.begin_transaction(1).expect("begin");
        state
            .set_balance(&addr(1), Amount::from_whole(25))
            .expect("seed");
        state.commit_transaction().expect("commit");
        let snapshot = state.wallet(&addr(1)).expect("wallet");
        let before = state.state_checksum();

        let journal = JournalTransaction::new(2);
        journal.append(JournalEntry::Destroy {
            target: addr(1),
            wallet: snapshot.clone(),
        });
        journal.append(JournalEntry::Create { target: addr(2) });
        journal.append(JournalEntry::Balance {
            target: addr(2),
            old: Amount::ZERO,
            new: Amount::from_whole(10),
        });

        assert!(state.apply_journal(&journal));
        assert!(!state.has_wallet(&addr(1)));
        assert_eq!(state.balance(&addr(2)), Amount::from_whole(10));

        assert!(state.revert_journal(&journal));
        assert_eq!(state.wallet(&addr(1)).expect("restored"), snapshot);
        assert!(!state.has_wallet(&addr(2)));
        assert_eq!(state.state_checksum(), before);
    }

    #[test]
    fn data_entry_guards_against_divergent_state() {
        let state = WalletState::new();
        state.begin_transaction(1).expect("begin");
        state
            .set_balance(&addr(1), Amount::from_whole(1))
            .expect("seed");
        state.set_user_data(&addr(1), Some(b"X")).expect("data");
        state.commit_transaction().expect("commit");

        let mismatched = JournalTransaction::new(2);
        mismatched.append(JournalEntry::Data {
            target: addr(1),
            new: Some(b"Z".to_vec()),
            old: Some(b"Y".to_vec()),
        });
        assert!(!state.apply_journal(&mismatched));

        let matching = JournalTransaction::new(3);
        matching.append(JournalEntry::Data {
            target: addr(1),
            new: Some(b"Z".to_vec()),
            old: Some(b"X".to_vec()),
        });
        assert!(state.apply_journal(&matching));
        assert_eq!(
            state.wallet(&addr(1)).expect("wallet").user_data,
            Some(b"Z".to_vec())
        );

        assert!(state.revert_journal(&matching));
        assert_eq!(
            state.wallet(&addr(1)).expect("wallet").user_data,
            Some(b"X".to_vec())
        );
    }

    #[test]
    fn signer_removal_adjusts_and_restores_required_count() {
        let state = WalletState::new();
        state.begin_transaction(1).expect("begin");
        state
            .set_balance(&addr(1), Amount::from_whole(1))
            .expect("seed");
        for signer in [addr(2), addr(3), addr(4)] {
            state.add_allowed_signer(&addr(1), &signer).expect("signer");
        }
        state.set_required_signatures(&addr(1), 2).expect("required");
        state.commit_transaction().expect("commit");

        let journal = JournalTransaction::new(2);
        journal.append(JournalEntry::AllowedSigner {
            target: addr(1),
            signer: addr(3),
            adding: false,
            adjust_signers: true,
        });
        assert!(state.apply_journal(&journal));
        let wallet = state.wallet(&addr(1)).expect("wallet");
        assert_eq!(wallet.allowed_signers.len(), 2);
        assert!(!wallet.allowed_signers.contains(&addr(3)));
        assert_eq!(wallet.required_signatures, 1);

        assert!(state.revert_journal(&journal));
        let wallet = state.wallet(&addr(1)).expect("wallet");
        assert_eq!(wallet.allowed_signers.len(), 3);
        assert!(wallet.allowed_signers.contains(&addr(3)));
        assert_eq!(wallet.required_signatures, 2);
    }

    #[test]
    fn journaled_and_direct_mutations_agree() {
        // drive one state through public mutators
        let direct = WalletState::new();
        direct.begin_transaction(5).expect("begin");
        direct
            .set_balance(&addr(1), Amount::from_whole(10))
            .expect("balance");
        direct.add_allowed_signer(&addr(1), &addr(2)).expect("signer");
        direct.set_user_data(&addr(1), Some(b"d")).expect("data");
        let journal = direct.commit_transaction().expect("commit");

        // replay the captured journal onto a fresh state
        let replayed = WalletState::new();
        assert!(replayed.apply_journal(&journal));
        assert_eq!(replayed.state_checksum(), direct.state_checksum());
    }

    #[test]
    fn affected_wallets_modes_differ_by_block_version() {
        let journal = JournalTransaction::new(1);
        for target in [addr(3), addr(1), addr(3), addr(2)] {
            journal.append(JournalEntry::Create { target });
        }
        assert_eq!(
            journal.affected_wallets(BLOCK_VERSION_ORDERED_WALLETS),
            vec![addr(3), addr(1), addr(2)]
        );
        assert_eq!(
            journal.affected_wallets(BLOCK_VERSION_ORDERED_WALLETS - 1),
            vec![addr(1), addr(2), addr(3)]
        );
    }

    #[test]
    fn partial_apply_failure_leaves_revert_to_caller() {
        let state = WalletState::new();
        state.begin_transaction(1).expect("begin");
        state
            .set_balance(&addr(1), Amount::from_whole(50))
            .expect("seed");
        state.commit_transaction().expect("commit");
        let before = state.state_checksum();

        let journal = JournalTransaction::new(2);
        journal.append(JournalEntry::Balance {
            target: addr(1),
            old: Amount::from_whole(50),
            new: Amount::from_whole(20),
        });
        // fails: wallet 2 has no data entry matching "missing"
        journal.append(JournalEntry::Data {
            target: addr(1),
            new: Some(b"n".to_vec()),
            old: Some(b"missing".to_vec()),
        });

        assert!(!state.apply_journal(&journal));
        // first entry took effect; the caller reverts the whole batch
        assert_eq!(state.balance(&addr(1)), Amount::from_whole(20));
        assert!(state.revert_journal(&journal));
        assert_eq!(state.state_checksum(), before);
    }
}
