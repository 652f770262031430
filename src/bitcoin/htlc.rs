//! Pure construction of the HTLC locking script and its unlocking variants.
//! No I/O happens here.

use crate::{bitcoin::pubkey_hash, error::Error, Secret, SecretHash, Timestamp};
use ::bitcoin::{
    blockdata::{
        opcodes,
        script::{Builder, Instruction},
    },
    secp256k1::ecdsa::Signature,
    Address, EcdsaSighashType, PubkeyHash, PublicKey, Script, Transaction,
};

/// A hash-time-locked contract:
///
/// ```text
/// OP_IF
///     <unlock_time> OP_CLTV OP_DROP
///     OP_DUP OP_HASH160 <refund_pubkey_hash> OP_EQUALVERIFY OP_CHECKSIG
/// OP_ELSE
///     OP_SIZE <secret_size> OP_EQUALVERIFY
///     OP_SHA256 <secret_hash> OP_EQUALVERIFY
///     OP_DUP OP_HASH160 <redeem_pubkey_hash> OP_EQUALVERIFY OP_CHECKSIG
/// OP_ENDIF
/// ```
///
/// Spendable by the counterparty's signature plus a preimage of exactly
/// `secret_size` bytes hashing to `secret_hash`, or by the refund key's
/// signature after `unlock_time`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Htlc {
    refund_pubkey_hash: PubkeyHash,
    redeem_pubkey_hash: PubkeyHash,
    unlock_time: Timestamp,
    secret_hash: SecretHash,
    secret_size: usize,
    script: Script,
}

impl Htlc {
    /// Builds the contract for the given parties. Both addresses must be
    /// P2PKH; the secret hash size is enforced by the [`SecretHash`] type.
    pub fn new(
        refund_address: &Address,
        redeem_address: &Address,
        unlock_time: Timestamp,
        secret_hash: SecretHash,
        secret_size: usize,
    ) -> Result<Self, Error> {
        let refund_pubkey_hash = pubkey_hash(refund_address)?;
        let redeem_pubkey_hash = pubkey_hash(redeem_address)?;
        let script = lock_script(
            &refund_pubkey_hash,
            &redeem_pubkey_hash,
            unlock_time,
            &secret_hash,
            secret_size,
        );

        Ok(Htlc {
            refund_pubkey_hash,
            redeem_pubkey_hash,
            unlock_time,
            secret_hash,
            secret_size,
            script,
        })
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn unlock_time(&self) -> Timestamp {
        self.unlock_time
    }

    pub fn secret_hash(&self) -> SecretHash {
        self.secret_hash
    }

    pub fn secret_size(&self) -> usize {
        self.secret_size
    }

    pub fn refund_pubkey_hash(&self) -> PubkeyHash {
        self.refund_pubkey_hash
    }

    pub fn redeem_pubkey_hash(&self) -> PubkeyHash {
        self.redeem_pubkey_hash
    }

    /// The output index of this contract within `transaction`, if any.
    pub fn find_output(&self, transaction: &Transaction) -> Option<usize> {
        transaction
            .output
            .iter()
            .position(|output| output.script_pubkey == self.script)
    }

    /// Unlocking script for the redeem path: signature, public key and the
    /// revealed secret, ending in OP_0 to select the hash branch.
    pub fn redeem_script_sig(
        &self,
        signature: &Signature,
        public_key: &PublicKey,
        secret: &Secret,
    ) -> Script {
        Builder::new()
            .push_slice(&signature_with_sighash(signature))
            .push_key(public_key)
            .push_slice(secret.raw_secret())
            .push_int(0)
            .into_script()
    }

    /// Unlocking script for the refund path: signature and public key,
    /// ending in OP_1 to select the time-lock branch. Only valid in a
    /// transaction whose lock time is at or past the deadline and whose
    /// input sequence enables lock-time semantics.
    pub fn refund_script_sig(&self, signature: &Signature, public_key: &PublicKey) -> Script {
        Builder::new()
            .push_slice(&signature_with_sighash(signature))
            .push_key(public_key)
            .push_int(1)
            .into_script()
    }
}

fn lock_script(
    refund_pubkey_hash: &PubkeyHash,
    redeem_pubkey_hash: &PubkeyHash,
    unlock_time: Timestamp,
    secret_hash: &SecretHash,
    secret_size: usize,
) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_IF)
        .push_int(i64::from(u32::from(unlock_time)))
        .push_opcode(opcodes::all::OP_CLTV)
        .push_opcode(opcodes::all::OP_DROP)
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&refund_pubkey_hash[..])
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ELSE)
        .push_opcode(opcodes::all::OP_SIZE)
        .push_int(secret_size as i64)
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_SHA256)
        .push_slice(&secret_hash.raw()[..])
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&redeem_pubkey_hash[..])
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

fn signature_with_sighash(signature: &Signature) -> Vec<u8> {
    let mut serialized = signature.serialize_der().to_vec();
    serialized.push(EcdsaSighashType::All.to_u32() as u8);
    serialized
}

/// Searches the spending transaction for a push-data element of exactly
/// `secret_size` bytes whose SHA-256 equals `secret_hash`. Both script_sig
/// push data and witness items are scanned.
pub fn extract_secret(
    transaction: &Transaction,
    secret_hash: &SecretHash,
    secret_size: usize,
) -> Option<Secret> {
    transaction.input.iter().find_map(|txin| {
        let script_items = txin.script_sig.instructions().filter_map(|instruction| {
            match instruction {
                Ok(Instruction::PushBytes(data)) => Some(data.to_vec()),
                _ => None,
            }
        });
        let witness_items = txin.witness.iter().map(|item| item.to_vec());

        script_items
            .chain(witness_items)
            .find_map(|candidate| match_secret(&candidate, secret_hash, secret_size))
    })
}

fn match_secret(candidate: &[u8], secret_hash: &SecretHash, secret_size: usize) -> Option<Secret> {
    if candidate.len() != secret_size {
        return None;
    }
    if SecretHash::hash_of_slice(candidate) != *secret_hash.raw() {
        return None;
    }
    Secret::from_vec(candidate).ok()
}

/// Whether a script_sig has the refund shape: its final element selects the
/// time-lock branch.
pub fn is_refund_spend(script_sig: &Script) -> bool {
    matches!(
        script_sig.instructions().last(),
        Some(Ok(Instruction::Op(op))) if op == opcodes::all::OP_PUSHNUM_1
    )
}

/// Whether a script_sig has the redeem shape: its final element is the empty
/// push selecting the hash branch.
pub fn is_redeem_spend(script_sig: &Script) -> bool {
    matches!(
        script_sig.instructions().last(),
        Some(Ok(Instruction::PushBytes(data))) if data.is_empty()
    )
}
