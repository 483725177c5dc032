//! In-memory wallet state and the reversible journal that mediates every
//! mutation applied during block processing.
//!
//! [`Wallets`] is the bare keyed map with the internal mutators used by
//! journal replay; [`WalletState`] wraps it in a lock, owns the active
//! journal transaction and exposes the public mutators that record an entry
//! before touching state.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::crypto;
use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Amount, Wallet};

mod journal;

pub use journal::{JournalEntry, JournalTransaction, BLOCK_VERSION_ORDERED_WALLETS};

/// Plain wallet map plus the running total balance.
///
/// The `*_internal` mutators are invoked by journal replay (and by the
/// public mutators of [`WalletState`]); each returns `false` when the
/// current state disagrees with the entry being applied, which callers must
/// treat as a corruption signal.
#[derive(Default)]
pub struct Wallets {
    wallets: HashMap<Address, Wallet>,
    total_balance: Amount,
}

impl Wallets {
    pub fn wallet(&self, address: &Address) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.wallets
            .get(address)
            .map(|wallet| wallet.balance)
            .unwrap_or(Amount::ZERO)
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn total_balance(&self) -> Amount {
        self.total_balance
    }

    /// Sets a wallet balance, creating the wallet when missing and pruning
    /// it again once it carries no information. The pruning keeps
    /// balance-driven wallet creation exactly reversible.
    pub(crate) fn set_balance_internal(
        &mut self,
        address: &Address,
        balance: &Amount,
        _revert: bool,
    ) -> bool {
        let wallet = self
            .wallets
            .entry(address.clone())
            .or_insert_with(|| Wallet::new(address.clone()));
        let old = wallet.balance;
        wallet.balance = *balance;
        if wallet.is_empty() {
            self.wallets.remove(address);
        }
        self.total_balance = self
            .total_balance
            .checked_sub(&old)
            .and_then(|t| t.checked_add(balance))
            .unwrap_or(self.total_balance);
        true
    }

    pub(crate) fn add_allowed_signer_internal(
        &mut self,
        address: &Address,
        signer: &Address,
        adjust_signers: bool,
        revert: bool,
    ) -> bool {
        let Some(wallet) = self.wallets.get_mut(address) else {
            warn!(target_wallet = %address, "cannot add signer to missing wallet");
            return false;
        };
        if !wallet.allowed_signers.insert(signer.clone()) {
            warn!(target_wallet = %address, %signer, revert, "signer already present");
            return false;
        }
        if adjust_signers {
            wallet.required_signatures = wallet.required_signatures.saturating_add(1);
        }
        true
    }

    pub(crate) fn remove_allowed_signer_internal(
        &mut self,
        address: &Address,
        signer: &Address,
        adjust_signers: bool,
        revert: bool,
    ) -> bool {
        let Some(wallet) = self.wallets.get_mut(address) else {
            warn!(target_wallet = %address, "cannot remove signer from missing wallet");
            return false;
        };
        if !wallet.allowed_signers.remove(signer) {
            warn!(target_wallet = %address, %signer, revert, "signer not present");
            return false;
        }
        if adjust_signers && wallet.required_signatures > 1 {
            wallet.required_signatures -= 1;
        }
        true
    }

    pub(crate) fn set_required_signatures_internal(&mut self, address: &Address, count: u8) -> bool {
        let Some(wallet) = self.wallets.get_mut(address) else {
            warn!(target_wallet = %address, "cannot set signature count on missing wallet");
            return false;
        };
        if count < 1 || count as usize > wallet.allowed_signers.len() + 1 {
            warn!(
                target_wallet = %address,
                count,
                signers = wallet.allowed_signers.len(),
                "signature count out of range"
            );
            return false;
        }
        wallet.required_signatures = count;
        true
    }

    pub(crate) fn set_pubkey_internal(
        &mut self,
        address: &Address,
        pubkey: Option<&[u8]>,
        _revert: bool,
    ) -> bool {
        let Some(wallet) = self.wallets.get_mut(address) else {
            warn!(target_wallet = %address, "cannot set public key on missing wallet");
            return false;
        };
        wallet.pubkey = pubkey.map(|pk| pk.to_vec());
        true
    }

    /// The current stored data must equal `old_for_validation`, which guards
    /// against replaying a data change onto divergent state.
    pub(crate) fn set_user_data_internal(
        &mut self,
        address: &Address,
        new: Option<&[u8]>,
        old_for_validation: Option<&[u8]>,
    ) -> bool {
        let Some(wallet) = self.wallets.get_mut(address) else {
            warn!(target_wallet = %address, "cannot set data on missing wallet");
            return false;
        };
        if wallet.user_data.as_deref() != old_for_validation {
            warn!(target_wallet = %address, "stored data diverges from expected prior value");
            return false;
        }
        wallet.user_data = new.map(|data| data.to_vec());
        true
    }

    pub(crate) fn create_wallet_internal(&mut self, address: &Address) -> bool {
        if self.wallets.contains_key(address) {
            warn!(target_wallet = %address, "wallet already exists");
            return false;
        }
        self.wallets
            .insert(address.clone(), Wallet::new(address.clone()));
        true
    }

    pub(crate) fn remove_wallet_internal(&mut self, address: &Address) -> bool {
        match self.wallets.remove(address) {
            Some(wallet) => {
                self.total_balance = self
                    .total_balance
                    .checked_sub(&wallet.balance)
                    .unwrap_or(self.total_balance);
                true
            }
            None => {
                warn!(target_wallet = %address, "cannot remove missing wallet");
                false
            }
        }
    }

    /// Restores a full wallet snapshot verbatim.
    pub(crate) fn set_wallet_internal(&mut self, address: &Address, wallet: Wallet) -> bool {
        let old_balance = self.balance(address);
        self.total_balance = self
            .total_balance
            .checked_sub(&old_balance)
            .and_then(|t| t.checked_add(&wallet.balance))
            .unwrap_or(self.total_balance);
        self.wallets.insert(address.clone(), wallet);
        true
    }
}

/// Locked wallet state with the journal-recording public mutators.
///
/// The write lock is held for the entire duration of applying or reverting
/// a journal transaction, matching the exclusive-access contract.
pub struct WalletState {
    inner: RwLock<StateInner>,
}

struct StateInner {
    wallets: Wallets,
    journal: Option<JournalTransaction>,
}

impl Default for WalletState {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner {
                wallets: Wallets::default(),
                journal: None,
            }),
        }
    }

    // --- journal lifecycle -------------------------------------------------

    /// Opens a journal transaction; every public mutation until commit or
    /// revert is recorded into it.
    pub fn begin_transaction(&self, number: u64) -> ChainResult<()> {
        let mut inner = self.inner.write();
        if inner.journal.is_some() {
            return Err(ChainError::State(
                "a journal transaction is already active".into(),
            ));
        }
        inner.journal = Some(JournalTransaction::new(number));
        Ok(())
    }

    /// Detaches and returns the active journal transaction.
    pub fn commit_transaction(&self) -> ChainResult<JournalTransaction> {
        let mut inner = self.inner.write();
        inner
            .journal
            .take()
            .ok_or_else(|| ChainError::State("no active journal transaction".into()))
    }

    /// Reverts the active journal transaction in place and discards it.
    pub fn revert_transaction(&self) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let journal = inner
            .journal
            .take()
            .ok_or_else(|| ChainError::State("no active journal transaction".into()))?;
        journal.revert(&mut inner.wallets);
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.read().journal.is_some()
    }

    /// Replays a detached journal transaction onto this state.
    pub fn apply_journal(&self, journal: &JournalTransaction) -> bool {
        let mut inner = self.inner.write();
        journal.apply(&mut inner.wallets)
    }

    /// Reverts a previously applied journal transaction.
    pub fn revert_journal(&self, journal: &JournalTransaction) -> bool {
        let mut inner = self.inner.write();
        journal.revert(&mut inner.wallets)
    }

    // --- public mutators ---------------------------------------------------
    //
    // Each records the matching journal entry first and then calls the
    // internal mutator; on internal failure the caller is responsible for
    // reverting the whole transaction.

    pub fn set_balance(&self, address: &Address, balance: Amount) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let old = inner.wallets.balance(address);
        Self::record(
            &mut inner,
            JournalEntry::Balance {
                target: address.clone(),
                old,
                new: balance,
            },
        )?;
        if !inner.wallets.set_balance_internal(address, &balance, false) {
            return Err(ChainError::State(format!(
                "failed to set balance for {address}"
            )));
        }
        Ok(())
    }

    pub fn adjust_balance(&self, address: &Address, delta: &Amount) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let old = inner.wallets.balance(address);
        let new = old
            .checked_add(delta)
            .ok_or_else(|| ChainError::State(format!("balance overflow for {address}")))?;
        if new.is_negative() {
            return Err(ChainError::State(format!(
                "balance for {address} would become negative"
            )));
        }
        Self::record(
            &mut inner,
            JournalEntry::Balance {
                target: address.clone(),
                old,
                new,
            },
        )?;
        if !inner.wallets.set_balance_internal(address, &new, false) {
            return Err(ChainError::State(format!(
                "failed to adjust balance for {address}"
            )));
        }
        Ok(())
    }

    pub fn create_wallet(&self, address: &Address) -> ChainResult<()> {
        let mut inner = self.inner.write();
        if inner.wallets.wallet(address).is_some() {
            return Err(ChainError::State(format!("wallet {address} already exists")));
        }
        Self::record(
            &mut inner,
            JournalEntry::Create {
                target: address.clone(),
            },
        )?;
        if !inner.wallets.create_wallet_internal(address) {
            return Err(ChainError::State(format!("failed to create {address}")));
        }
        Ok(())
    }

    pub fn destroy_wallet(&self, address: &Address) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let snapshot = inner
            .wallets
            .wallet(address)
            .cloned()
            .ok_or_else(|| ChainError::State(format!("wallet {address} does not exist")))?;
        Self::record(
            &mut inner,
            JournalEntry::Destroy {
                target: address.clone(),
                wallet: snapshot,
            },
        )?;
        if !inner.wallets.remove_wallet_internal(address) {
            return Err(ChainError::State(format!("failed to destroy {address}")));
        }
        Ok(())
    }

    pub fn add_allowed_signer(&self, address: &Address, signer: &Address) -> ChainResult<()> {
        let mut inner = self.inner.write();
        Self::record(
            &mut inner,
            JournalEntry::AllowedSigner {
                target: address.clone(),
                signer: signer.clone(),
                adding: true,
                adjust_signers: false,
            },
        )?;
        if !inner
            .wallets
            .add_allowed_signer_internal(address, signer, false, false)
        {
            return Err(ChainError::State(format!(
                "failed to add signer {signer} to {address}"
            )));
        }
        Ok(())
    }

    pub fn remove_allowed_signer(
        &self,
        address: &Address,
        signer: &Address,
        adjust_signers: bool,
    ) -> ChainResult<()> {
        let mut inner = self.inner.write();
        Self::record(
            &mut inner,
            JournalEntry::AllowedSigner {
                target: address.clone(),
                signer: signer.clone(),
                adding: false,
                adjust_signers,
            },
        )?;
        if !inner
            .wallets
            .remove_allowed_signer_internal(address, signer, adjust_signers, false)
        {
            return Err(ChainError::State(format!(
                "failed to remove signer {signer} from {address}"
            )));
        }
        Ok(())
    }

    pub fn set_required_signatures(&self, address: &Address, count: u8) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let old = inner
            .wallets
            .wallet(address)
            .map(|wallet| wallet.required_signatures)
            .ok_or_else(|| ChainError::State(format!("wallet {address} does not exist")))?;
        Self::record(
            &mut inner,
            JournalEntry::RequiredSignatures {
                target: address.clone(),
                old,
                new: count,
            },
        )?;
        if !inner.wallets.set_required_signatures_internal(address, count) {
            return Err(ChainError::State(format!(
                "failed to set signature count on {address}"
            )));
        }
        Ok(())
    }

    pub fn set_pubkey(&self, address: &Address, pubkey: &[u8]) -> ChainResult<()> {
        let mut inner = self.inner.write();
        Self::record(
            &mut inner,
            JournalEntry::Pubkey {
                target: address.clone(),
                pubkey: pubkey.to_vec(),
            },
        )?;
        if !inner
            .wallets
            .set_pubkey_internal(address, Some(pubkey), false)
        {
            return Err(ChainError::State(format!(
                "failed to set public key on {address}"
            )));
        }
        Ok(())
    }

    pub fn set_user_data(&self, address: &Address, data: Option<&[u8]>) -> ChainResult<()> {
        let mut inner = self.inner.write();
        let old = inner
            .wallets
            .wallet(address)
            .map(|wallet| wallet.user_data.clone())
            .ok_or_else(|| ChainError::State(format!("wallet {address} does not exist")))?;
        Self::record(
            &mut inner,
            JournalEntry::Data {
                target: address.clone(),
                new: data.map(|d| d.to_vec()),
                old: old.clone(),
            },
        )?;
        if !inner
            .wallets
            .set_user_data_internal(address, data, old.as_deref())
        {
            return Err(ChainError::State(format!(
                "failed to set data on {address}"
            )));
        }
        Ok(())
    }

    fn record(inner: &mut StateInner, entry: JournalEntry) -> ChainResult<()> {
        match inner.journal.as_ref() {
            Some(journal) => {
                journal.append(entry);
                Ok(())
            }
            None => Err(ChainError::State(
                "no active journal transaction".into(),
            )),
        }
    }

    // --- read accessors ----------------------------------------------------

    pub fn wallet(&self, address: &Address) -> Option<Wallet> {
        self.inner.read().wallets.wallet(address).cloned()
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.inner.read().wallets.balance(address)
    }

    pub fn has_wallet(&self, address: &Address) -> bool {
        self.inner.read().wallets.wallet(address).is_some()
    }

    pub fn wallet_count(&self) -> usize {
        self.inner.read().wallets.len()
    }

    pub fn total_balance(&self) -> Amount {
        self.inner.read().wallets.total_balance()
    }

    /// Merkle root over all wallets sorted by address bytes.
    pub fn state_checksum(&self) -> Vec<u8> {
        let inner = self.inner.read();
        let mut wallets: Vec<&Wallet> = inner.wallets.wallets.values().collect();
        wallets.sort_by(|a, b| a.id.cmp(&b.id));
        let mut leaves: Vec<Vec<u8>> = wallets
            .iter()
            .map(|wallet| crypto::hash(&wallet.to_bytes()))
            .collect();
        compute_merkle_root(&mut leaves)
    }

    /// Rolling checksum over an explicit wallet list, in the given order.
    /// Feeding it the affected wallets of a block's journal produces the
    /// per-block wallet-state checksum, so the order of `affected` matters.
    pub fn delta_checksum(&self, affected: &[Address]) -> Vec<u8> {
        let inner = self.inner.read();
        let mut acc = crypto::hash(b"wallet-state-delta");
        for address in affected {
            let mut data = acc.clone();
            match inner.wallets.wallet(address) {
                Some(wallet) => data.extend_from_slice(&wallet.to_bytes()),
                None => data.extend_from_slice(address.as_bytes()),
            }
            acc = crypto::hash(&data);
        }
        acc
    }
}

pub fn compute_merkle_root(leaves: &mut Vec<Vec<u8>>) -> Vec<u8> {
    if leaves.is_empty() {
        return crypto::hash(b"tessera-empty");
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            let mut data = Vec::with_capacity(left.len() + right.len());
            data.extend_from_slice(left);
            data.extend_from_slice(right);
            next.push(crypto::hash(&data));
        }
        *leaves = next;
    }
    leaves[0].clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from_bytes(&[byte; 20])
    }

    fn seeded_state() -> WalletState {
        let state = WalletState::new();
        state.begin_transaction(1).expect("begin");
        state
            .set_balance(&addr(1), Amount::from_whole(100))
            .expect("seed balance");
        state.commit_transaction().expect("commit");
        state
    }

    #[test]
    fn mutations_require_an_active_transaction() {
        let state = WalletState::new();
        let err = state.set_balance(&addr(1), Amount::from_whole(1));
        assert!(matches!(err, Err(ChainError::State(_))));
    }

    #[test]
    fn adjust_balance_records_old_and_new() {
        let state = seeded_state();
        state.begin_transaction(2).expect("begin");
        state
            .adjust_balance(&addr(1), &-Amount::from_whole(60))
            .expect("adjust");
        state
            .adjust_balance(&addr(1), &Amount::from_whole(15))
            .expect("adjust");
        assert_eq!(state.balance(&addr(1)), Amount::from_whole(55));

        state.revert_transaction().expect("revert");
        assert_eq!(state.balance(&addr(1)), Amount::from_whole(100));
    }

    #[test]
    fn adjust_balance_rejects_overdraft() {
        let state = seeded_state();
        state.begin_transaction(2).expect("begin");
        let err = state.adjust_balance(&addr(1), &-Amount::from_whole(101));
        assert!(matches!(err, Err(ChainError::State(_))));
        state.revert_transaction().expect("revert");
        assert_eq!(state.balance(&addr(1)), Amount::from_whole(100));
    }

    #[test]
    fn total_balance_tracks_mutations() {
        let state = seeded_state();
        assert_eq!(state.total_balance(), Amount::from_whole(100));
        state.begin_transaction(2).expect("begin");
        state
            .set_balance(&addr(2), Amount::from_whole(50))
            .expect("second wallet");
        assert_eq!(state.total_balance(), Amount::from_whole(150));
        state.destroy_wallet(&addr(2)).expect("destroy");
        assert_eq!(state.total_balance(), Amount::from_whole(100));
        state.commit_transaction().expect("commit");
    }

    #[test]
    fn pubkey_set_is_unconditional_and_revert_clears_it() {
        let state = seeded_state();
        state.begin_transaction(2).expect("begin");
        state.set_pubkey(&addr(1), &[7u8; 32]).expect("set pubkey");
        // re-keying a wallet that already has a key is a plain set
        state.set_pubkey(&addr(1), &[8u8; 32]).expect("re-key");
        assert_eq!(
            state.wallet(&addr(1)).expect("wallet").pubkey,
            Some(vec![8u8; 32])
        );
        state.revert_transaction().expect("revert");
        assert!(state.wallet(&addr(1)).expect("wallet").pubkey.is_none());
    }

    #[test]
    fn state_checksum_changes_with_content() {
        let state = seeded_state();
        let before = state.state_checksum();
        state.begin_transaction(2).expect("begin");
        state
            .adjust_balance(&addr(1), &Amount::from_whole(1))
            .expect("adjust");
        state.commit_transaction().expect("commit");
        assert_ne!(state.state_checksum(), before);
    }

    #[test]
    fn delta_checksum_is_order_sensitive() {
        let state = seeded_state();
        state.begin_transaction(2).expect("begin");
        state
            .set_balance(&addr(2), Amount::from_whole(5))
            .expect("balance");
        state.commit_transaction().expect("commit");

        let forward = state.delta_checksum(&[addr(1), addr(2)]);
        let backward = state.delta_checksum(&[addr(2), addr(1)]);
        assert_ne!(forward, backward);
    }
}
