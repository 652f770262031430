//! Constructs payment, refund and redeem transactions from candidate
//! unspent outputs and a live fee rate. All fee arithmetic is integer, in
//! satoshi.

use crate::{
    api::Utxo,
    bitcoin::{htlc::Htlc, SEQUENCE_ALLOW_NTIMELOCK_NO_RBF, SEQUENCE_FINAL},
    config::Config,
    error::Error,
    SecretHash, Timestamp,
};
use ::bitcoin::{
    Address, Amount, OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// Virtual size of a P2PKH input including its signature.
pub const P2PKH_INPUT_SIZE: u64 = 148;
/// Virtual size of a P2WPKH input including its witness.
pub const P2WPKH_INPUT_SIZE: u64 = 68;
/// Virtual size of an input spending an HTLC output: signature, public key,
/// secret, branch selector and the redeem script itself.
pub const HTLC_INPUT_SIZE: u64 = 219;
pub const OUTPUT_SIZE: u64 = 34;
pub const TX_OVERHEAD: u64 = 10;
/// Outputs below this are not worth creating; dust change is folded into
/// the fee.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Replacement budget before a bumped redeem reaches the final sequence.
const REPLACEMENT_BUDGET: u32 = 1024;

/// An unsigned payment transaction together with everything needed to sign
/// and later spend it.
#[derive(Clone, Debug)]
pub struct Payment {
    pub transaction: Transaction,
    pub htlc: Htlc,
    /// The outputs the transaction spends, in input order.
    pub spent: Vec<Utxo>,
}

#[derive(Clone, Debug)]
pub struct TransactionFactory {
    config: Config,
}

impl TransactionFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Selects a minimal subset of `outputs` covering `amount` plus fee and
    /// builds a transaction with one HTLC output of `amount` and a change
    /// output back to `refund_address`.
    ///
    /// If no selection satisfies `fee_rate`, an effective rate is recomputed
    /// from the surplus over `amount`; the transaction is only built if that
    /// rate still clears the configured floor.
    #[allow(clippy::too_many_arguments)]
    pub fn create_payment(
        &self,
        outputs: &[Utxo],
        amount: Amount,
        refund_address: &Address,
        to_address: &Address,
        lock_time: Timestamp,
        secret_hash: SecretHash,
        secret_size: usize,
        fee_rate: u64,
    ) -> Result<Payment, Error> {
        let htlc = Htlc::new(refund_address, to_address, lock_time, secret_hash, secret_size)?;

        let available = outputs
            .iter()
            .fold(Amount::ZERO, |acc, utxo| acc + utxo.value);
        if available <= amount {
            return Err(Error::InsufficientFunds {
                available,
                required: amount,
            });
        }

        let mut candidates: Vec<&Utxo> = outputs.iter().collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value));

        // Grow the selection largest-first until it covers amount + fee at
        // the requested rate.
        let mut selected_value = Amount::ZERO;
        for count in 1..=candidates.len() {
            let selection = &candidates[..count];
            selected_value = selected_value + selection[count - 1].value;

            let fee = Amount::from_sat(estimate_size(selection, 2) * fee_rate);
            let required = amount + fee;
            if selected_value < required {
                continue;
            }

            let change = selected_value - required;
            let mut outputs = vec![TxOut {
                value: amount.to_sat(),
                script_pubkey: htlc.script().clone(),
            }];
            if change > DUST_LIMIT {
                outputs.push(TxOut {
                    value: change.to_sat(),
                    script_pubkey: refund_address.script_pubkey(),
                });
            }

            return Ok(Payment {
                transaction: build_unsigned(selection, outputs, PackedLockTime::ZERO, SEQUENCE_FINAL),
                htlc,
                spent: selection.iter().map(|utxo| (*utxo).clone()).collect(),
            });
        }

        // The configured rate cannot be satisfied: spend everything, let the
        // whole surplus be the fee and check it still clears the floor.
        let size = estimate_size(&candidates, 1);
        let surplus = available - amount;
        let effective_rate = surplus.to_sat() / size;
        if effective_rate < self.config.min_fee_rate {
            let floor_fee = Amount::from_sat(size * self.config.min_fee_rate);
            return Err(Error::InsufficientFunds {
                available,
                required: amount + floor_fee,
            });
        }

        let outputs = vec![TxOut {
            value: amount.to_sat(),
            script_pubkey: htlc.script().clone(),
        }];

        Ok(Payment {
            transaction: build_unsigned(&candidates, outputs, PackedLockTime::ZERO, SEQUENCE_FINAL),
            htlc,
            spent: candidates.into_iter().cloned().collect(),
        })
    }

    /// Spends the HTLC output of `payment_tx` back to `refund_address`,
    /// paying `amount - fee`. The transaction's lock time is the HTLC
    /// deadline so it only becomes valid once the deadline passes.
    pub fn create_refund(
        &self,
        payment_tx: &Transaction,
        amount: Amount,
        refund_address: &Address,
        htlc: &Htlc,
        lock_time: Timestamp,
        fee_rate: u64,
    ) -> Result<Transaction, Error> {
        self.spend_htlc_output(
            payment_tx,
            amount,
            refund_address,
            htlc,
            PackedLockTime(u32::from(lock_time)),
            SEQUENCE_ALLOW_NTIMELOCK_NO_RBF,
            fee_rate,
        )
    }

    /// Spends the HTLC output of `payment_tx` to `redeem_address`, paying
    /// `amount - fee`. `sequence` carries the replacement policy: a bumped
    /// value produces a replacement for an evicted redeem.
    pub fn create_redeem(
        &self,
        payment_tx: &Transaction,
        amount: Amount,
        redeem_address: &Address,
        htlc: &Htlc,
        sequence: Sequence,
        fee_rate: u64,
    ) -> Result<Transaction, Error> {
        self.spend_htlc_output(
            payment_tx,
            amount,
            redeem_address,
            htlc,
            PackedLockTime::ZERO,
            sequence,
            fee_rate,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spend_htlc_output(
        &self,
        payment_tx: &Transaction,
        amount: Amount,
        destination: &Address,
        htlc: &Htlc,
        lock_time: PackedLockTime,
        sequence: Sequence,
        fee_rate: u64,
    ) -> Result<Transaction, Error> {
        let vout = htlc.find_output(payment_tx).ok_or_else(|| {
            Error::TransactionCreation("payment transaction has no htlc output".to_string())
        })?;

        let size = TX_OVERHEAD + HTLC_INPUT_SIZE + OUTPUT_SIZE;
        let fee = Amount::from_sat(size * fee_rate.max(self.config.min_fee_rate));
        if fee >= amount {
            return Err(Error::InsufficientFunds {
                available: amount,
                required: fee,
            });
        }

        Ok(Transaction {
            version: 2,
            lock_time,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: payment_tx.txid(),
                    vout: vout as u32,
                },
                script_sig: Script::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: (amount - fee).to_sat(),
                script_pubkey: destination.script_pubkey(),
            }],
        })
    }
}

/// Next sequence number for a replacement redeem: a monotonic bump from 0
/// towards [`SEQUENCE_FINAL`], never decreasing, never exceeding it. The
/// step count before the ceiling is an implementation-defined retry budget.
pub fn next_redeem_sequence(current: Sequence) -> Sequence {
    let near_final = SEQUENCE_FINAL.0 - REPLACEMENT_BUDGET;
    if current.0 < near_final {
        Sequence(near_final)
    } else if current.0 < SEQUENCE_FINAL.0 {
        Sequence(current.0 + 1)
    } else {
        SEQUENCE_FINAL
    }
}

fn input_size(utxo: &Utxo) -> u64 {
    if utxo.is_segwit() {
        P2WPKH_INPUT_SIZE
    } else {
        P2PKH_INPUT_SIZE
    }
}

/// Estimated virtual size: per-input sizes, per-output size, constant
/// overhead and one extra byte for the witness flag when any spent output
/// is segregated-witness.
fn estimate_size(inputs: &[&Utxo], n_outputs: u64) -> u64 {
    let witness_flag = u64::from(inputs.iter().any(|utxo| utxo.is_segwit()));
    inputs.iter().map(|utxo| input_size(utxo)).sum::<u64>()
        + n_outputs * OUTPUT_SIZE
        + TX_OVERHEAD
        + witness_flag
}

fn build_unsigned(
    inputs: &[&Utxo],
    output: Vec<TxOut>,
    lock_time: PackedLockTime,
    sequence: Sequence,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time,
        input: inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: Script::new(),
                sequence,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}
