//! Signing of payment, redeem and refund transactions.
//!
//! Every signature produced here is verified against the signing key before
//! the transaction leaves this module. A transaction that fails that check
//! is never handed to the broadcaster.

use crate::{
    api::{Signer, Utxo},
    bitcoin::{htlc::Htlc, SEQUENCE_ALLOW_NTIMELOCK_NO_RBF},
    bitcoin::transaction::Payment,
    error::Error,
    Secret, SecretHash,
};
use ::bitcoin::{
    blockdata::script::Builder,
    hashes::Hash as _,
    secp256k1::{ecdsa::Signature, All, Message, Secp256k1},
    util::sighash::SighashCache,
    Address, EcdsaSighashType, PublicKey, Script, Transaction, Witness,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct SwapSigner {
    signer: Arc<dyn Signer>,
    secp: Secp256k1<All>,
}

impl SwapSigner {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self {
            signer,
            secp: Secp256k1::new(),
        }
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    /// Signs every input of a payment transaction. Inputs are owned wallet
    /// outputs, either P2PKH or P2WPKH.
    pub async fn sign_payment(&self, payment: &mut Payment) -> anyhow::Result<()> {
        let sighashes = payment_sighashes(&payment.transaction, &payment.spent)?;

        for (index, (utxo, sighash)) in payment.spent.iter().zip(sighashes).enumerate() {
            let public_key = self.signer.public_key(&utxo.address).await?;
            let signature = self.signer.sign_hash(sighash, &utxo.address).await?;
            self.verify(sighash, &signature, &public_key)?;

            let mut serialized = signature.serialize_der().to_vec();
            serialized.push(EcdsaSighashType::All.to_u32() as u8);

            let input = &mut payment.transaction.input[index];
            if utxo.is_segwit() {
                input.witness =
                    Witness::from_vec(vec![serialized, public_key.to_bytes()]);
            } else {
                input.script_sig = Builder::new()
                    .push_slice(&serialized)
                    .push_key(&public_key)
                    .into_script();
            }
        }

        Ok(())
    }

    /// Signs a redeem of the counterparty's HTLC output with the revealed
    /// secret. Verifies the secret against the contract before touching the
    /// key material. A transaction that already carries a valid unlock is
    /// left untouched.
    pub async fn sign_redeem(
        &self,
        transaction: &mut Transaction,
        htlc: &Htlc,
        secret: Secret,
        redeem_address: &Address,
    ) -> anyhow::Result<()> {
        if secret.raw_secret().len() != htlc.secret_size() {
            return Err(Error::TransactionSigning(
                "secret length does not match the contract".to_string(),
            )
            .into());
        }
        if SecretHash::new(secret) != htlc.secret_hash() {
            return Err(Error::InvalidSecretHash.into());
        }

        let sighash = htlc_sighash(transaction, htlc.script())?;
        if self.already_unlocked(transaction, sighash)? {
            return Ok(());
        }

        let public_key = self.signer.public_key(redeem_address).await?;
        let signature = self.signer.sign_hash(sighash, redeem_address).await?;
        self.verify(sighash, &signature, &public_key)?;

        transaction.input[0].script_sig =
            htlc.redeem_script_sig(&signature, &public_key, &secret);

        Ok(())
    }

    /// Signs a refund of our own HTLC output. Refuses a transaction whose
    /// lock time or sequence would let it spend before the contract
    /// deadline. A transaction that already carries a valid unlock is left
    /// untouched.
    pub async fn sign_refund(
        &self,
        transaction: &mut Transaction,
        htlc: &Htlc,
        refund_address: &Address,
    ) -> anyhow::Result<()> {
        if transaction.lock_time.0 < u32::from(htlc.unlock_time()) {
            return Err(Error::TransactionVerification(
                "refund lock time precedes the contract deadline".to_string(),
            )
            .into());
        }
        if transaction.input[0].sequence != SEQUENCE_ALLOW_NTIMELOCK_NO_RBF {
            return Err(Error::TransactionVerification(
                "refund sequence does not enable lock-time checking".to_string(),
            )
            .into());
        }

        let sighash = htlc_sighash(transaction, htlc.script())?;
        if self.already_unlocked(transaction, sighash)? {
            return Ok(());
        }

        let public_key = self.signer.public_key(refund_address).await?;
        let signature = self.signer.sign_hash(sighash, refund_address).await?;
        self.verify(sighash, &signature, &public_key)?;

        transaction.input[0].script_sig = htlc.refund_script_sig(&signature, &public_key);

        Ok(())
    }

    /// Checks whether input 0 already carries an unlock whose signature
    /// verifies for `sighash`. A non-empty script_sig that does not verify
    /// is an error; re-signing would silently mask corrupted state.
    fn already_unlocked(
        &self,
        transaction: &Transaction,
        sighash: [u8; 32],
    ) -> anyhow::Result<bool> {
        let script_sig = &transaction.input[0].script_sig;
        if script_sig.is_empty() {
            return Ok(false);
        }

        let (signature, public_key) = parse_unlock(script_sig)?;
        self.verify(sighash, &signature, &public_key)?;

        Ok(true)
    }

    fn verify(
        &self,
        sighash: [u8; 32],
        signature: &Signature,
        public_key: &PublicKey,
    ) -> anyhow::Result<()> {
        let message = Message::from_slice(&sighash)
            .map_err(|e| Error::TransactionSigning(e.to_string()))?;
        self.secp
            .verify_ecdsa(&message, signature, &public_key.inner)
            .map_err(|e| Error::TransactionSigning(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for SwapSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapSigner").finish_non_exhaustive()
    }
}

/// Legacy sighashes for every input of an unsigned payment transaction.
/// Computed before any script_sig is filled in.
fn payment_sighashes(
    transaction: &Transaction,
    spent: &[Utxo],
) -> anyhow::Result<Vec<[u8; 32]>> {
    if transaction.input.len() != spent.len() {
        return Err(Error::TransactionSigning(
            "spent output list does not match transaction inputs".to_string(),
        )
        .into());
    }

    let mut cache = SighashCache::new(transaction);
    let mut sighashes = Vec::with_capacity(spent.len());

    for (index, utxo) in spent.iter().enumerate() {
        let sighash = if utxo.is_segwit() {
            let script_code = p2wpkh_script_code(&utxo.script_pubkey)?;
            cache
                .segwit_signature_hash(
                    index,
                    &script_code,
                    utxo.value.to_sat(),
                    EcdsaSighashType::All,
                )?
                .into_inner()
        } else {
            cache
                .legacy_signature_hash(
                    index,
                    &utxo.script_pubkey,
                    EcdsaSighashType::All.to_u32(),
                )?
                .into_inner()
        };
        sighashes.push(sighash);
    }

    Ok(sighashes)
}

/// Legacy sighash of input 0 spending an HTLC output; the redeem script is
/// the HTLC's locking script itself.
fn htlc_sighash(transaction: &Transaction, script: &Script) -> anyhow::Result<[u8; 32]> {
    let sighash = SighashCache::new(transaction)
        .legacy_signature_hash(0, script, EcdsaSighashType::All.to_u32())?
        .into_inner();
    Ok(sighash)
}

/// The P2PKH-shaped script code behind a P2WPKH output.
fn p2wpkh_script_code(script_pubkey: &Script) -> anyhow::Result<Script> {
    if !script_pubkey.is_v0_p2wpkh() {
        return Err(Error::TransactionSigning(
            "unsupported segwit output type".to_string(),
        )
        .into());
    }
    // A v0 P2WPKH script is OP_0 <20-byte hash>.
    let program = &script_pubkey.as_bytes()[2..22];
    let pubkey_hash = ::bitcoin::PubkeyHash::from_slice(program)
        .map_err(|e| Error::TransactionSigning(e.to_string()))?;
    Ok(Script::new_p2pkh(&pubkey_hash))
}

/// Signature and public key from the leading pushes of an HTLC unlock.
fn parse_unlock(script_sig: &Script) -> anyhow::Result<(Signature, PublicKey)> {
    use ::bitcoin::blockdata::script::Instruction;

    let mut pushes = script_sig.instructions().filter_map(|instruction| {
        match instruction {
            Ok(Instruction::PushBytes(data)) => Some(data.to_vec()),
            _ => None,
        }
    });

    let signature = pushes
        .next()
        .filter(|data| !data.is_empty())
        .ok_or_else(|| Error::TransactionSigning("unlock has no signature".to_string()))?;
    let public_key = pushes
        .next()
        .ok_or_else(|| Error::TransactionSigning("unlock has no public key".to_string()))?;

    // Drop the trailing sighash-type byte before parsing the DER signature.
    let signature = Signature::from_der(&signature[..signature.len() - 1])
        .map_err(|e| Error::TransactionSigning(e.to_string()))?;
    let public_key = PublicKey::from_slice(&public_key)
        .map_err(|e| Error::TransactionSigning(e.to_string()))?;

    Ok((signature, public_key))
}
