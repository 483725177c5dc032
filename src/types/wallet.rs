use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::errors::ChainResult;

use super::codec::{write_bytes, write_opt_bytes, ByteReader};
use super::{Address, Amount};

/// A single ledger wallet: balance, optional public key, optional user data
/// and the multi-signature configuration.
///
/// Invariants: `required_signatures >= 1` and
/// `required_signatures <= allowed_signers.len() + 1` (the wallet's own key
/// counts as a signer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Address,
    pub balance: Amount,
    pub pubkey: Option<Vec<u8>>,
    pub allowed_signers: BTreeSet<Address>,
    pub required_signatures: u8,
    pub user_data: Option<Vec<u8>>,
}

impl Wallet {
    pub fn new(id: Address) -> Self {
        Self {
            id,
            balance: Amount::ZERO,
            pubkey: None,
            allowed_signers: BTreeSet::new(),
            required_signatures: 1,
            user_data: None,
        }
    }

    pub fn is_multisig(&self) -> bool {
        !self.allowed_signers.is_empty()
    }

    /// A wallet in this state carries no information and may be pruned.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero()
            && !self.is_multisig()
            && self.pubkey.is_none()
            && self.user_data.is_none()
    }

    /// Binary codec: little-endian, every byte string length-prefixed with
    /// an `i32` (0 = absent), fields in declaration order. Signers are
    /// written in address-byte order, which `BTreeSet` iteration yields.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_bytes(&mut buf, self.id.as_bytes());
        write_bytes(&mut buf, self.balance.to_string().as_bytes());
        write_opt_bytes(&mut buf, self.pubkey.as_deref());
        super::codec::write_i32(&mut buf, self.allowed_signers.len() as i32);
        for signer in &self.allowed_signers {
            write_bytes(&mut buf, signer.as_bytes());
        }
        buf.push(self.required_signatures);
        write_opt_bytes(&mut buf, self.user_data.as_deref());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        Self::read_from(&mut reader)
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let id = Address::from(reader.read_bytes()?);
        let balance: Amount = String::from_utf8_lossy(&reader.read_bytes()?).parse()?;
        let pubkey = reader.read_opt_bytes()?;
        let signer_count = reader.read_i32()?;
        let mut allowed_signers = BTreeSet::new();
        for _ in 0..signer_count {
            allowed_signers.insert(Address::from(reader.read_bytes()?));
        }
        let required_signatures = reader.read_u8()?;
        let user_data = reader.read_opt_bytes()?;
        Ok(Self {
            id,
            balance,
            pubkey,
            allowed_signers,
            required_signatures,
            user_data,
        })
    }

    pub fn checksum(&self) -> Vec<u8> {
        crypto::hash(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_wallet() -> Wallet {
        let mut wallet = Wallet::new(Address::from_bytes(&[9u8; 20]));
        wallet.balance = Amount::from_whole(125);
        wallet.pubkey = Some(vec![3u8; 44]);
        wallet.allowed_signers.insert(Address::from_bytes(&[1u8; 20]));
        wallet.allowed_signers.insert(Address::from_bytes(&[2u8; 20]));
        wallet.required_signatures = 2;
        wallet.user_data = Some(b"metadata".to_vec());
        wallet
    }

    #[test]
    fn codec_round_trips_full_wallet() {
        let wallet = sample_wallet();
        let decoded = Wallet::from_bytes(&wallet.to_bytes()).expect("decode");
        assert_eq!(decoded, wallet);
    }

    #[test]
    fn codec_round_trips_minimal_wallet() {
        let wallet = Wallet::new(Address::from_bytes(&[4u8; 20]));
        let decoded = Wallet::from_bytes(&wallet.to_bytes()).expect("decode");
        assert_eq!(decoded, wallet);
        assert!(decoded.is_empty());
    }

    #[test]
    fn checksum_tracks_content() {
        let wallet = sample_wallet();
        let mut altered = wallet.clone();
        altered.balance = Amount::from_whole(126);
        assert_ne!(wallet.checksum(), altered.checksum());
    }
}
