//! Deterministic fixtures and in-memory fakes shared across test modules.

use crate::{
    api::{
        AddressRepository, BlockchainApi, ConfirmationStatus, OrderId, OrderRegistry, Signer,
        SpentPoint, SwapMessageClient, SwapRepository, Utxo,
    },
    swap::{ReceivedSwap, Side, Status, SwapId},
    Secret, Swap, Timestamp,
};
use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::{ecdsa::Signature, All, Message, Secp256k1},
    Address, Amount, Network, OutPoint, PackedLockTime, PrivateKey, PublicKey, Script, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

/// Deterministic regtest key material; `n` must be non-zero.
pub fn keypair(n: u8) -> (PrivateKey, PublicKey, Address) {
    let secp = Secp256k1::new();
    let secret_key = bitcoin::secp256k1::SecretKey::from_slice(&[n; 32]).unwrap();
    let private_key = PrivateKey::new(secret_key, Network::Regtest);
    let public_key = PublicKey::from_private_key(&secp, &private_key);
    let address = Address::p2pkh(&public_key, Network::Regtest);
    (private_key, public_key, address)
}

pub fn utxo(n: u8, address: &Address, value: Amount) -> Utxo {
    Utxo {
        outpoint: OutPoint {
            txid: Txid::hash(&[n]),
            vout: 0,
        },
        value,
        script_pubkey: address.script_pubkey(),
        address: address.clone(),
    }
}

pub fn received_stub(id: SwapId, is_initiator: bool) -> ReceivedSwap {
    let (_, _, party_address) = keypair(2);
    ReceivedSwap {
        id,
        order_id: OrderId(1),
        timestamp: Timestamp::now(),
        sold_currency: "BTC".to_string(),
        purchased_currency: "LTC".to_string(),
        qty: Amount::from_sat(100_000),
        price: 1_500,
        side: Side::Maker,
        is_initiator,
        status: BTreeSet::from([Status::Initiated]),
        secret_hash: None,
        party_address: Some(party_address.to_string()),
        party_refund_address: Some(party_address.to_string()),
        party_reward_for_redeem: 0,
    }
}

pub fn swap_stub(id: SwapId, is_initiator: bool) -> Swap {
    Swap::new(&received_stub(id, is_initiator))
}

/// A transaction with one output paying `sat` to `script`.
pub fn transaction_paying(script: &Script, sat: u64) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Script::new(),
            sequence: Sequence(0xFFFF_FFFF),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: sat,
            script_pubkey: script.clone(),
        }],
    }
}

/// A transaction spending `txid:vout` with the given unlocking script.
pub fn transaction_spending(txid: Txid, vout: u32, script_sig: Script) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid, vout },
            script_sig,
            sequence: Sequence(0),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: 1_000,
            script_pubkey: Script::new(),
        }],
    }
}

/// Signs with the keys behind [`keypair`], looked up by address.
pub struct LocalSigner {
    secp: Secp256k1<All>,
    keys: Vec<(Address, PrivateKey, PublicKey)>,
}

impl LocalSigner {
    pub fn new() -> Self {
        let keys = (1..=8)
            .map(|n| {
                let (private_key, public_key, address) = keypair(n);
                (address, private_key, public_key)
            })
            .collect();
        Self {
            secp: Secp256k1::new(),
            keys,
        }
    }

    fn key_for(&self, address: &Address) -> anyhow::Result<&(Address, PrivateKey, PublicKey)> {
        self.keys
            .iter()
            .find(|(known, _, _)| known == address)
            .ok_or_else(|| anyhow::anyhow!("no key for address {}", address))
    }
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Signer for LocalSigner {
    async fn sign_hash(&self, hash: [u8; 32], address: &Address) -> anyhow::Result<Signature> {
        let (_, private_key, _) = self.key_for(address)?;
        let message = Message::from_slice(&hash)?;
        Ok(self.secp.sign_ecdsa(&message, &private_key.inner))
    }

    async fn public_key(&self, address: &Address) -> anyhow::Result<PublicKey> {
        let (_, _, public_key) = self.key_for(address)?;
        Ok(*public_key)
    }

    async fn derive_swap_secret(&self, timestamp: Timestamp) -> anyhow::Result<Secret> {
        let mut preimage = b"swap-secret".to_vec();
        preimage.extend_from_slice(&timestamp.to_bytes());
        Ok(Secret::from(
            sha256::Hash::hash(&preimage).into_inner(),
        ))
    }
}

/// Scriptable in-memory chain. Broadcasts confirm immediately unless the
/// transaction is [`StaticBlockchain::forget`]-ten afterwards.
pub struct StaticBlockchain {
    fee_rate: u64,
    utxo_counter: AtomicU64,
    utxos: Mutex<Vec<Utxo>>,
    broadcasts: Mutex<Vec<Transaction>>,
    confirmed: Mutex<HashMap<Txid, Transaction>>,
    spent: Mutex<HashMap<(Txid, u32), SpentPoint>>,
    outputs_by_script: Mutex<HashMap<Script, (Transaction, u32)>>,
}

impl StaticBlockchain {
    pub fn new(fee_rate: u64) -> Self {
        Self {
            fee_rate,
            utxo_counter: AtomicU64::new(0),
            utxos: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            confirmed: Mutex::new(HashMap::new()),
            spent: Mutex::new(HashMap::new()),
            outputs_by_script: Mutex::new(HashMap::new()),
        }
    }

    pub fn fund(&self, address: &Address, value: Amount) {
        let n = self.utxo_counter.fetch_add(1, Ordering::SeqCst);
        self.utxos.lock().unwrap().push(Utxo {
            outpoint: OutPoint {
                txid: Txid::hash(&n.to_le_bytes()),
                vout: 0,
            },
            value,
            script_pubkey: address.script_pubkey(),
            address: address.clone(),
        });
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().unwrap().clone()
    }

    /// Makes a transaction visible to `find_output_by_script` and marks it
    /// confirmed.
    pub fn seed_output(&self, script: &Script, transaction: &Transaction, vout: u32) {
        self.outputs_by_script
            .lock()
            .unwrap()
            .insert(script.clone(), (transaction.clone(), vout));
        self.confirmed
            .lock()
            .unwrap()
            .insert(transaction.txid(), transaction.clone());
    }

    pub fn seed_spent(&self, txid: Txid, vout: u32, spent: SpentPoint) {
        self.spent.lock().unwrap().insert((txid, vout), spent);
    }

    /// Drops all knowledge of a transaction, as a mempool eviction would.
    pub fn forget(&self, txid: Txid) {
        self.confirmed.lock().unwrap().remove(&txid);
    }
}

#[async_trait::async_trait]
impl BlockchainApi for StaticBlockchain {
    async fn balance(&self, address: &Address) -> anyhow::Result<Amount> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .iter()
            .filter(|utxo| &utxo.address == address)
            .fold(Amount::ZERO, |acc, utxo| acc + utxo.value))
    }

    async fn unspent_outputs(&self, address: &Address) -> anyhow::Result<Vec<Utxo>> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .iter()
            .filter(|utxo| &utxo.address == address)
            .cloned()
            .collect())
    }

    async fn broadcast(&self, transaction: &Transaction) -> anyhow::Result<Txid> {
        let txid = transaction.txid();
        self.broadcasts.lock().unwrap().push(transaction.clone());
        self.confirmed
            .lock()
            .unwrap()
            .insert(txid, transaction.clone());
        Ok(txid)
    }

    async fn transaction(&self, txid: Txid) -> anyhow::Result<Option<Transaction>> {
        Ok(self.confirmed.lock().unwrap().get(&txid).cloned())
    }

    async fn confirmation_status(&self, txid: Txid) -> anyhow::Result<ConfirmationStatus> {
        Ok(match self.confirmed.lock().unwrap().get(&txid) {
            Some(transaction) => ConfirmationStatus::Confirmed(transaction.clone()),
            None => ConfirmationStatus::NotFound,
        })
    }

    async fn spent_point(&self, txid: Txid, vout: u32) -> anyhow::Result<Option<SpentPoint>> {
        Ok(self.spent.lock().unwrap().get(&(txid, vout)).cloned())
    }

    async fn find_output_by_script(
        &self,
        script: &Script,
    ) -> anyhow::Result<Option<(Transaction, u32)>> {
        Ok(self.outputs_by_script.lock().unwrap().get(script).cloned())
    }

    async fn fee_rate(&self) -> anyhow::Result<u64> {
        Ok(self.fee_rate)
    }
}

pub struct StaticAddresses {
    addresses: Vec<Address>,
}

impl StaticAddresses {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }
}

#[async_trait::async_trait]
impl AddressRepository for StaticAddresses {
    async fn free_address(&self) -> anyhow::Result<Address> {
        Ok(self.addresses[0].clone())
    }

    async fn known_addresses(&self) -> anyhow::Result<Vec<Address>> {
        Ok(self.addresses.clone())
    }
}

/// Repository backed by a map; `with_latency` widens the window for lost
/// updates so locking bugs surface.
pub struct InMemorySwapRepository {
    swaps: Mutex<HashMap<SwapId, Swap>>,
    inserts: AtomicUsize,
    latency: Duration,
}

impl InMemorySwapRepository {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            swaps: Mutex::new(HashMap::new()),
            inserts: AtomicUsize::new(0),
            latency,
        }
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

impl Default for InMemorySwapRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SwapRepository for InMemorySwapRepository {
    async fn swap(&self, id: SwapId) -> anyhow::Result<Option<Swap>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.swaps.lock().unwrap().get(&id).cloned())
    }

    async fn insert(&self, swap: &Swap) -> anyhow::Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.swaps.lock().unwrap().insert(swap.id, swap.clone());
        Ok(())
    }

    async fn update(&self, swap: &Swap) -> anyhow::Result<()> {
        let mut swaps = self.swaps.lock().unwrap();
        if let Some(stored) = swaps.get(&swap.id) {
            // progress may never move backwards
            assert!(swap.progress.is_superset(&stored.progress));
        }
        swaps.insert(swap.id, swap.clone());
        Ok(())
    }

    async fn all(&self) -> anyhow::Result<Vec<Swap>> {
        Ok(self.swaps.lock().unwrap().values().cloned().collect())
    }
}

/// Records outbound protocol messages instead of sending them.
pub struct NullMessages {
    initiates: Mutex<Vec<SwapId>>,
    accepts: Mutex<Vec<SwapId>>,
    status_requests: Mutex<Vec<SwapId>>,
}

impl NullMessages {
    pub fn new() -> Self {
        Self {
            initiates: Mutex::new(Vec::new()),
            accepts: Mutex::new(Vec::new()),
            status_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn initiates(&self) -> Vec<SwapId> {
        self.initiates.lock().unwrap().clone()
    }

    pub fn accepts(&self) -> Vec<SwapId> {
        self.accepts.lock().unwrap().clone()
    }

    pub fn status_requests(&self) -> Vec<SwapId> {
        self.status_requests.lock().unwrap().clone()
    }
}

impl Default for NullMessages {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SwapMessageClient for NullMessages {
    async fn send_initiate(&self, swap: &Swap) -> anyhow::Result<()> {
        self.initiates.lock().unwrap().push(swap.id);
        Ok(())
    }

    async fn send_accept(&self, swap: &Swap) -> anyhow::Result<()> {
        self.accepts.lock().unwrap().push(swap.id);
        Ok(())
    }

    async fn send_status_request(&self, id: SwapId) -> anyhow::Result<()> {
        self.status_requests.lock().unwrap().push(id);
        Ok(())
    }
}

pub struct ApproveAllOrders;

#[async_trait::async_trait]
impl OrderRegistry for ApproveAllOrders {
    async fn is_approved(&self, _order_id: OrderId) -> anyhow::Result<bool> {
        Ok(true)
    }
}

pub struct RecordingOrders {
    approved: bool,
    checked: Mutex<Vec<OrderId>>,
}

impl RecordingOrders {
    pub fn rejecting() -> Self {
        Self {
            approved: false,
            checked: Mutex::new(Vec::new()),
        }
    }

    pub fn checked(&self) -> Vec<OrderId> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OrderRegistry for RecordingOrders {
    async fn is_approved(&self, order_id: OrderId) -> anyhow::Result<bool> {
        self.checked.lock().unwrap().push(order_id);
        Ok(self.approved)
    }
}
