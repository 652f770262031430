//! Bitcoin-family HTLC implementation: script construction, transaction
//! factory, swap signer and the currency-swap strategy built on top.

pub mod htlc;
pub mod signer;
pub mod swap;
pub mod transaction;

pub use self::{
    htlc::Htlc, signer::SwapSigner, swap::BitcoinSwap, transaction::TransactionFactory,
};

use crate::error::Error;
use ::bitcoin::{util::address::Payload, Address, PubkeyHash, Sequence};

/// Final sequence number; a transaction input carrying it can no longer be
/// replaced.
pub const SEQUENCE_FINAL: Sequence = Sequence(0xFFFF_FFFF);

/// Enables absolute lock-time checking without opting into RBF.
pub const SEQUENCE_ALLOW_NTIMELOCK_NO_RBF: Sequence = Sequence(0xFFFF_FFFE);

/// The pubkey hash behind a P2PKH address. HTLC scripts are keyed by pubkey
/// hashes, so anything else the counterparty hands us is rejected as
/// [`Error::InvalidWallets`].
pub fn pubkey_hash(address: &Address) -> Result<PubkeyHash, Error> {
    match &address.payload {
        Payload::PubkeyHash(pubkey_hash) => Ok(*pubkey_hash),
        _ => Err(Error::InvalidWallets),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::bitcoin::{secp256k1::Secp256k1, Network, PrivateKey, PublicKey};
    use std::str::FromStr;

    #[test]
    fn pubkey_hash_rejects_non_p2pkh_addresses() {
        let secp = Secp256k1::new();
        let private_key =
            PrivateKey::from_str("L4nZrdzNnawCtaEcYGWuPqagQA3dJxVPgN8ARTXaMLCxiYCy89wm").unwrap();
        let public_key = PublicKey::from_private_key(&secp, &private_key);

        let p2pkh = Address::p2pkh(&public_key, Network::Bitcoin);
        assert!(pubkey_hash(&p2pkh).is_ok());

        let p2wpkh = Address::p2wpkh(&public_key, Network::Bitcoin).unwrap();
        assert_eq!(pubkey_hash(&p2wpkh).unwrap_err(), Error::InvalidWallets);
    }
}
