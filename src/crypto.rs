use sha2::{Digest, Sha512};

use crate::types::Address;

/// Length in bytes of every content digest produced by this module.
pub const HASH_LEN: usize = 32;

/// Truncated SHA-512: the first [`HASH_LEN`] bytes of the SHA-512 digest.
///
/// Every checksum in the system (journal entries, wallets, wallet-state
/// roots) goes through this function so digests stay comparable across
/// components.
pub fn hash(data: &[u8]) -> Vec<u8> {
    let digest = Sha512::digest(data);
    digest[..HASH_LEN].to_vec()
}

/// Derives the signer address for a public key by hashing the raw key bytes.
pub fn address_from_pubkey(pubkey: &[u8]) -> Address {
    Address::from_bytes(&hash(pubkey))
}
