//! The central swap record and its append-only progress tracking.

use crate::{api::OrderId, config::Config, error::Error, Secret, SecretHash, Timestamp};
use bitcoin::{Address, Amount, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// Stable numeric swap identifier, assigned by the counterpart exchange
/// service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwapId(pub i64);

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Side {
    Maker,
    Taker,
}

/// Independently-settable protocol facts. Signing, broadcast and
/// confirmation of payment, redeem and refund proceed on separate,
/// partially-overlapping timelines, so progress is a set of bits rather
/// than a single enum.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum StateFlag {
    HasSecret,
    HasSecretHash,
    IsPaymentSigned,
    IsPaymentBroadcast,
    IsPaymentConfirmed,
    IsRedeemSigned,
    IsRedeemBroadcast,
    IsRedeemConfirmed,
    IsRefundSigned,
    IsRefundBroadcast,
    IsRefundConfirmed,
    IsCanceled,
    HasPartyPayment,
    IsPartyPaymentConfirmed,
}

/// Grow-only fact set. There is deliberately no way to remove a flag: any
/// concurrent reader sees a monotonically growing set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress(BTreeSet<StateFlag>);

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fact. Returns `true` if it was not known before.
    pub fn add(&mut self, flag: StateFlag) -> bool {
        self.0.insert(flag)
    }

    pub fn contains(&self, flag: StateFlag) -> bool {
        self.0.contains(&flag)
    }

    /// Flags present in `self` but not in `earlier`. Well-defined because
    /// flags are never unset.
    pub fn since(&self, earlier: &Progress) -> Vec<StateFlag> {
        self.0.difference(&earlier.0).copied().collect()
    }

    pub fn is_superset(&self, other: &Progress) -> bool {
        self.0.is_superset(&other.0)
    }
}

/// Server-reported negotiation status, driven entirely by the counterpart
/// service. Distinct from [`Progress`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum Status {
    Initiated,
    Accepted,
    InitiatorPaymentReceived,
    AcceptorPaymentReceived,
    InitiatorRedeemed,
    AcceptorRedeemed,
    InitiatorRefunded,
    AcceptorRefunded,
}

/// Inbound protocol message: the counterpart service's view of a swap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceivedSwap {
    pub id: SwapId,
    pub order_id: OrderId,
    pub timestamp: Timestamp,
    pub sold_currency: String,
    pub purchased_currency: String,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub qty: Amount,
    /// Price in smallest counter-currency units per unit; carried for the
    /// record, the engine itself only moves `qty`.
    pub price: u64,
    pub side: Side,
    pub is_initiator: bool,
    pub status: BTreeSet<Status>,
    /// Counterparty-supplied values arrive as raw strings and are validated
    /// before being accepted into the swap record.
    pub secret_hash: Option<String>,
    pub party_address: Option<String>,
    pub party_refund_address: Option<String>,
    pub party_reward_for_redeem: u64,
}

/// One negotiated trade. Created on first sighting of a server swap id,
/// mutated only while the owning per-swap lock is held, never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    pub order_id: OrderId,
    pub timestamp: Timestamp,
    pub sold_currency: String,
    pub purchased_currency: String,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub qty: Amount,
    pub price: u64,
    pub side: Side,
    pub is_initiator: bool,

    pub secret: Option<Secret>,
    pub secret_hash: Option<SecretHash>,

    pub party_address: Option<Address>,
    pub party_refund_address: Option<Address>,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub party_reward_for_redeem: Amount,
    pub to_address: Option<Address>,
    pub refund_address: Option<Address>,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub reward_for_redeem: Amount,

    pub payment_tx_id: Option<Txid>,
    pub redeem_tx_id: Option<Txid>,
    pub refund_tx_id: Option<Txid>,
    pub payment_tx: Option<Transaction>,
    pub party_payment_tx: Option<Transaction>,
    pub redeem_tx: Option<Transaction>,
    pub refund_tx: Option<Transaction>,
    pub redeem_broadcast_at: Option<Timestamp>,

    pub progress: Progress,
    pub status: BTreeSet<Status>,
}

impl Swap {
    pub fn new(received: &ReceivedSwap) -> Self {
        Self {
            id: received.id,
            order_id: received.order_id,
            timestamp: received.timestamp,
            sold_currency: received.sold_currency.clone(),
            purchased_currency: received.purchased_currency.clone(),
            qty: received.qty,
            price: received.price,
            side: received.side,
            is_initiator: received.is_initiator,
            secret: None,
            secret_hash: None,
            party_address: None,
            party_refund_address: None,
            party_reward_for_redeem: Amount::ZERO,
            to_address: None,
            refund_address: None,
            reward_for_redeem: Amount::ZERO,
            payment_tx_id: None,
            redeem_tx_id: None,
            refund_tx_id: None,
            payment_tx: None,
            party_payment_tx: None,
            redeem_tx: None,
            refund_tx: None,
            redeem_broadcast_at: None,
            progress: Progress::new(),
            status: received.status.clone(),
        }
    }

    /// A swap is active while none of the terminal facts is known.
    pub fn is_active(&self) -> bool {
        !(self.progress.contains(StateFlag::IsRedeemConfirmed)
            || self.progress.contains(StateFlag::IsRefundConfirmed)
            || self.progress.contains(StateFlag::IsCanceled))
    }

    /// Deadline of our own HTLC: the time after which only its refund path
    /// is valid.
    pub fn lock_time(&self, config: &Config) -> Timestamp {
        let lock = if self.is_initiator {
            config.initiator_lock_time
        } else {
            config.acceptor_lock_time
        };
        self.timestamp.plus(lock)
    }

    /// Deadline of the counterparty's HTLC.
    pub fn party_lock_time(&self, config: &Config) -> Timestamp {
        let lock = if self.is_initiator {
            config.acceptor_lock_time
        } else {
            config.initiator_lock_time
        };
        self.timestamp.plus(lock)
    }

    /// Latest time by which our payment must have been broadcast.
    pub fn payment_deadline(&self, config: &Config) -> Timestamp {
        if self.is_initiator {
            self.timestamp.plus(config.max_swap_timeout)
        } else {
            self.timestamp
                .plus(config.acceptor_lock_time)
                .minus(config.payment_time_reserve)
        }
    }

    /// Hard deadline past which the initiator refuses to build a new redeem
    /// of the acceptor's payment.
    pub fn redeem_deadline(&self, config: &Config) -> Timestamp {
        self.party_lock_time(config).minus(config.redeem_time_reserve)
    }

    /// Pins the secret hash. Accepting a hash that differs from an
    /// already-pinned one is a protocol violation.
    pub fn pin_secret_hash(&mut self, hash: SecretHash) -> Result<(), Error> {
        match self.secret_hash {
            Some(existing) if existing != hash => Err(Error::InvalidSecretHash),
            Some(_) => Ok(()),
            None => {
                self.secret_hash = Some(hash);
                self.progress.add(StateFlag::HasSecretHash);
                Ok(())
            }
        }
    }

    /// Pins the counterparty's redeem address. The party addresses are
    /// baked into the contract scripts, so a later message carrying a
    /// different value is a protocol violation.
    pub fn pin_party_address(&mut self, address: Address) -> Result<(), Error> {
        pin_address(&mut self.party_address, address)
    }

    /// Pins the counterparty's refund address.
    pub fn pin_party_refund_address(&mut self, address: Address) -> Result<(), Error> {
        pin_address(&mut self.party_refund_address, address)
    }

    /// Records a revealed secret after checking it reproduces the pinned
    /// hash.
    pub fn set_secret(&mut self, secret: Secret) -> Result<(), Error> {
        match self.secret_hash {
            Some(pinned) if SecretHash::new(secret) == pinned => {
                self.secret = Some(secret);
                self.progress.add(StateFlag::HasSecret);
                Ok(())
            }
            Some(_) => Err(Error::InvalidSecretHash),
            None => {
                let hash = SecretHash::new(secret);
                self.secret = Some(secret);
                self.secret_hash = Some(hash);
                self.progress.add(StateFlag::HasSecret);
                self.progress.add(StateFlag::HasSecretHash);
                Ok(())
            }
        }
    }
}

fn pin_address(slot: &mut Option<Address>, address: Address) -> Result<(), Error> {
    match slot {
        Some(existing) if *existing != address => Err(Error::InvalidWallets),
        Some(_) => Ok(()),
        None => {
            *slot = Some(address);
            Ok(())
        }
    }
}
