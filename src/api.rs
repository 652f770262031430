//! Capability traits the engine consumes. Block explorers, durable storage,
//! key material and the message transport all live behind these interfaces;
//! the engine never talks to the outside world any other way.

use crate::{swap::SwapId, Secret, Swap, Timestamp};
use bitcoin::{secp256k1::ecdsa::Signature, Address, Amount, OutPoint, PublicKey, Script,
              Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An unspent output a payment transaction may draw from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: Script,
    pub address: Address,
}

impl Utxo {
    pub fn is_segwit(&self) -> bool {
        self.script_pubkey.is_witness_program()
    }
}

/// Result of a confirmation lookup.
///
/// `NotFound` is deliberately distinct from `Pending`: it means the node no
/// longer knows the transaction at all, i.e. the mempool evicted it, which
/// triggers redeem replacement instead of blind retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Confirmed(Transaction),
    Pending,
    NotFound,
}

/// The input that spent a watched output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentPoint {
    pub spending_tx: Transaction,
    pub input_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Read/broadcast access to a blockchain, typically backed by a node or a
/// block-explorer API. Shared across all currency-swap instances; must
/// tolerate concurrent calls.
#[async_trait::async_trait]
pub trait BlockchainApi: Send + Sync {
    async fn balance(&self, address: &Address) -> anyhow::Result<Amount>;
    async fn unspent_outputs(&self, address: &Address) -> anyhow::Result<Vec<Utxo>>;
    async fn broadcast(&self, transaction: &Transaction) -> anyhow::Result<Txid>;
    async fn transaction(&self, txid: Txid) -> anyhow::Result<Option<Transaction>>;
    async fn confirmation_status(&self, txid: Txid) -> anyhow::Result<ConfirmationStatus>;
    /// The input spending `txid:vout`, if any.
    async fn spent_point(&self, txid: Txid, vout: u32) -> anyhow::Result<Option<SpentPoint>>;
    /// Locates a confirmed or mempool output paying exactly `script`.
    async fn find_output_by_script(
        &self,
        script: &Script,
    ) -> anyhow::Result<Option<(Transaction, u32)>>;
    /// Current fee rate in satoshi per virtual byte.
    async fn fee_rate(&self) -> anyhow::Result<u64>;
}

/// Durable storage for swap records. The engine defines the record schema
/// ([`Swap`]); the storage layer owns the encoding.
#[async_trait::async_trait]
pub trait SwapRepository: Send + Sync {
    async fn swap(&self, id: SwapId) -> anyhow::Result<Option<Swap>>;
    async fn insert(&self, swap: &Swap) -> anyhow::Result<()>;
    async fn update(&self, swap: &Swap) -> anyhow::Result<()>;
    async fn all(&self) -> anyhow::Result<Vec<Swap>>;
}

/// Wallet address book for one currency.
#[async_trait::async_trait]
pub trait AddressRepository: Send + Sync {
    /// A fresh address under our control, used for redeem and refund outputs.
    async fn free_address(&self) -> anyhow::Result<Address>;
    /// Every address whose outputs we may spend.
    async fn known_addresses(&self) -> anyhow::Result<Vec<Address>>;
}

/// Raw signing primitives, keyed by the address owning the input being
/// signed. Key derivation stays behind this boundary.
#[async_trait::async_trait]
pub trait Signer: Send + Sync {
    async fn sign_hash(&self, hash: [u8; 32], address: &Address) -> anyhow::Result<Signature>;
    async fn public_key(&self, address: &Address) -> anyhow::Result<PublicKey>;
    /// Deterministically derives the swap secret from the wallet and the
    /// negotiation timestamp. Never re-derived once a swap has its secret.
    async fn derive_swap_secret(&self, timestamp: Timestamp) -> anyhow::Result<Secret>;
}

/// Outbound half of the protocol transport. Inbound messages arrive as calls
/// into [`crate::manager::SwapManager::handle_swap`].
#[async_trait::async_trait]
pub trait SwapMessageClient: Send + Sync {
    async fn send_initiate(&self, swap: &Swap) -> anyhow::Result<()>;
    async fn send_accept(&self, swap: &Swap) -> anyhow::Result<()>;
    async fn send_status_request(&self, id: SwapId) -> anyhow::Result<()>;
}

/// Order-book collaborator; only consulted to check that the order a swap
/// originates from was approved by us.
#[async_trait::async_trait]
pub trait OrderRegistry: Send + Sync {
    async fn is_approved(&self, order_id: OrderId) -> anyhow::Result<bool>;
}
