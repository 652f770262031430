//! Orchestration of all swaps: inbound protocol messages, the event loop,
//! restore-on-restart and the timeout sweep.
//!
//! Every mutation of a swap record happens here, under that swap's
//! exclusive lock, and is committed through [`SwapManager::commit`] so
//! persistence and update broadcasting cannot drift apart.

use crate::{
    api::{OrderRegistry, Signer, SwapMessageClient, SwapRepository},
    config::Config,
    currency::CurrencySwap,
    error::Error,
    event::{SwapEvent, SwapUpdate},
    lock::LockRegistry,
    supervisor::Supervisor,
    swap::{Progress, ReceivedSwap, StateFlag, SwapId},
    SecretHash, Swap,
};
use bitcoin::{Address, Amount};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tokio::sync::{broadcast, mpsc, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const UPDATE_CHANNEL_CAPACITY: usize = 256;

pub struct SwapManager {
    config: Config,
    repository: Arc<dyn SwapRepository>,
    orders: Arc<dyn OrderRegistry>,
    messages: Arc<dyn SwapMessageClient>,
    signer: Arc<dyn Signer>,
    currencies: HashMap<String, Arc<dyn CurrencySwap>>,
    locks: LockRegistry,
    events: mpsc::Sender<SwapEvent>,
    event_source: Mutex<Option<mpsc::Receiver<SwapEvent>>>,
    updates: broadcast::Sender<SwapUpdate>,
    supervisor: Arc<Supervisor>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SwapManager {
    pub fn new(
        config: Config,
        repository: Arc<dyn SwapRepository>,
        orders: Arc<dyn OrderRegistry>,
        messages: Arc<dyn SwapMessageClient>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let (events, event_source) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let supervisor = Arc::new(Supervisor::new(events.clone()));

        Self {
            config,
            repository,
            orders,
            messages,
            signer,
            currencies: HashMap::new(),
            locks: LockRegistry::new(),
            events,
            event_source: Mutex::new(Some(event_source)),
            updates,
            supervisor,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Sender handed to currency swaps so their watchers can report back.
    pub fn event_sender(&self) -> mpsc::Sender<SwapEvent> {
        self.events.clone()
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Registers the strategy serving one currency. Must happen before
    /// [`SwapManager::start`].
    pub fn add_currency(&mut self, currency: Arc<dyn CurrencySwap>) {
        self.currencies
            .insert(currency.currency().to_string(), currency);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapUpdate> {
        self.updates.subscribe()
    }

    /// Starts the event loop and the timeout sweep, then replays every
    /// active swap from storage.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        let mut source = self
            .event_source
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("manager already started"))?;

        let manager = self.clone();
        let event_loop = tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                let id = event.swap_id();
                if let Err(error) = manager.apply_event(event).await {
                    tracing::error!(swap_id = %id, "failed to apply event: {:#}", error);
                }
            }
        });

        let manager = self.clone();
        let interval = self.config.timeout_sweep_interval;
        let sweep = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(error) = manager.sweep_timeouts().await {
                    tracing::error!("timeout sweep failed: {:#}", error);
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(event_loop);
            tasks.push(sweep);
        }

        self.restore_swaps().await;
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.supervisor.shutdown();
    }

    /// Entry point for an inbound protocol message about a swap. The first
    /// sighting of an id creates the record; later sightings merge the
    /// counterparty's view into it.
    pub async fn handle_swap(&self, received: ReceivedSwap) -> anyhow::Result<()> {
        let _guard = self.locks.acquire(received.id).await?;

        match self.repository.swap(received.id).await? {
            None => self.register_swap(received).await,
            Some(swap) => self.update_swap(swap, received).await,
        }
    }

    async fn register_swap(&self, received: ReceivedSwap) -> anyhow::Result<()> {
        if !self.orders.is_approved(received.order_id).await? {
            return Err(Error::OrderNotApproved(received.order_id).into());
        }

        let mut swap = Swap::new(&received);
        self.apply_received(&mut swap, &received)?;
        self.assign_addresses(&mut swap).await?;

        if swap.is_initiator {
            let secret = self.signer.derive_swap_secret(swap.timestamp).await?;
            swap.set_secret(secret)?;
            self.messages.send_initiate(&swap).await?;
        } else if swap.secret_hash.is_some() {
            self.messages.send_accept(&swap).await?;
        }

        self.repository.insert(&swap).await?;
        tracing::info!(swap_id = %swap.id, side = %swap.side, "registered swap");

        let before = swap.progress.clone();
        self.run_steps(&mut swap).await?;
        self.commit(&swap, &before).await
    }

    async fn update_swap(&self, mut swap: Swap, received: ReceivedSwap) -> anyhow::Result<()> {
        let before = swap.progress.clone();

        swap.status.extend(received.status.iter().copied());
        self.apply_received(&mut swap, &received)?;

        // An acceptor first learns the secret hash here; acknowledge it.
        if !swap.is_initiator
            && swap.secret_hash.is_some()
            && !before.contains(StateFlag::HasSecretHash)
        {
            self.messages.send_accept(&swap).await?;
        }

        if swap.is_active() {
            self.run_steps(&mut swap).await?;
        }
        self.commit(&swap, &before).await
    }

    /// Validates counterparty-supplied fields and merges them into the
    /// record. Rejecting here keeps malformed protocol data out of storage.
    fn apply_received(&self, swap: &mut Swap, received: &ReceivedSwap) -> anyhow::Result<()> {
        if let Some(hash) = &received.secret_hash {
            let hash = SecretHash::from_str(hash).map_err(|_| Error::InvalidSecretHash)?;
            swap.pin_secret_hash(hash)?;
        }

        if let Some(address) = &received.party_address {
            let address = Address::from_str(address).map_err(|_| Error::InvalidWallets)?;
            swap.pin_party_address(address)?;
        }
        if let Some(address) = &received.party_refund_address {
            let address = Address::from_str(address).map_err(|_| Error::InvalidWallets)?;
            swap.pin_party_refund_address(address)?;
        }

        let reward = Amount::from_sat(received.party_reward_for_redeem);
        if reward >= swap.qty && reward > Amount::ZERO {
            return Err(Error::InvalidRewardForRedeem.into());
        }
        swap.party_reward_for_redeem = reward;

        Ok(())
    }

    /// Our receive and refund addresses, assigned once at creation.
    async fn assign_addresses(&self, swap: &mut Swap) -> anyhow::Result<()> {
        let sold = self.currency(&swap.sold_currency)?;
        let purchased = self.currency(&swap.purchased_currency)?;

        let to_address = purchased.free_address().await?;
        swap.reward_for_redeem = purchased.reward_for_redeem(&to_address).await?;
        swap.to_address = Some(to_address);
        swap.refund_address = Some(sold.free_address().await?);

        Ok(())
    }

    /// Drives the steps currently unblocked for a swap. Each step is
    /// re-entrant, so calling this from several triggers is harmless.
    async fn run_steps(&self, swap: &mut Swap) -> anyhow::Result<()> {
        if swap.secret_hash.is_none()
            || swap.party_address.is_none()
            || swap.party_refund_address.is_none()
        {
            // Nothing can proceed before the hash and the counterparty's
            // requisites are negotiated.
            return Ok(());
        }
        let sold = self.currency(&swap.sold_currency)?;
        let purchased = self.currency(&swap.purchased_currency)?;

        if !swap.progress.contains(StateFlag::IsPartyPaymentConfirmed) {
            purchased.start_party_payment_control(swap).await?;
        }

        sold.pay(swap).await?;
        if swap.progress.contains(StateFlag::IsPaymentBroadcast)
            && !swap.progress.contains(StateFlag::IsRefundConfirmed)
        {
            sold.start_wait_for_redeem(swap).await?;
        }

        Ok(())
    }

    /// Applies one observation to its swap, under the swap's lock, and
    /// commits the outcome.
    async fn apply_event(&self, event: SwapEvent) -> anyhow::Result<()> {
        let id = event.swap_id();
        let _guard = self.locks.acquire(id).await?;

        let mut swap = match self.repository.swap(id).await? {
            Some(swap) => swap,
            None => {
                tracing::warn!(swap_id = %id, "event for unknown swap: {}", event);
                return Ok(());
            }
        };
        let before = swap.progress.clone();

        match event {
            SwapEvent::PartyPaymentDetected { transaction, .. } => {
                swap.party_payment_tx = Some(transaction);
                swap.progress.add(StateFlag::HasPartyPayment);
            }
            SwapEvent::PartyPaymentConfirmed { .. } => {
                swap.progress.add(StateFlag::IsPartyPaymentConfirmed);
                if swap.is_initiator {
                    // Their leg is locked in; claim it.
                    self.currency(&swap.purchased_currency)?
                        .redeem(&mut swap)
                        .await?;
                } else {
                    self.run_steps(&mut swap).await?;
                }
            }
            SwapEvent::PaymentConfirmed { .. } => {
                swap.progress.add(StateFlag::IsPaymentConfirmed);
            }
            SwapEvent::PaymentSpent { secret, .. } => {
                swap.set_secret(secret)?;
                self.currency(&swap.purchased_currency)?
                    .redeem(&mut swap)
                    .await?;
            }
            SwapEvent::PaymentRefunded { .. } => {
                swap.progress.add(StateFlag::IsRefundBroadcast);
                swap.progress.add(StateFlag::IsRefundConfirmed);
            }
            SwapEvent::RefundTimeElapsed { .. } => {
                self.currency(&swap.sold_currency)?.refund(&mut swap).await?;
            }
            SwapEvent::RedeemConfirmed { .. } => {
                swap.progress.add(StateFlag::IsRedeemConfirmed);
            }
            SwapEvent::RedeemEvicted { .. } => {
                self.currency(&swap.purchased_currency)?
                    .redeem(&mut swap)
                    .await?;
            }
            SwapEvent::RefundBroadcast { txid, .. } => {
                swap.refund_tx_id = Some(txid);
                swap.progress.add(StateFlag::IsRefundBroadcast);
            }
            SwapEvent::RefundConfirmed { .. } => {
                swap.progress.add(StateFlag::IsRefundConfirmed);
            }
            SwapEvent::Canceled { .. } => {
                if !swap.progress.contains(StateFlag::IsPaymentBroadcast) {
                    swap.progress.add(StateFlag::IsCanceled);
                }
            }
            SwapEvent::SpentPointInvalid { .. } => {
                tracing::error!(swap_id = %id, "htlc output spent by an unknown script");
                swap.progress.add(StateFlag::IsCanceled);
            }
            SwapEvent::StepFailed { error, .. } => {
                tracing::warn!(swap_id = %id, "swap step failed: {}", error);
            }
        }

        self.commit(&swap, &before).await
    }

    /// Replays every stored swap after a restart. Failures are isolated per
    /// swap; one broken record never blocks the rest.
    async fn restore_swaps(&self) {
        let swaps = match self.repository.all().await {
            Ok(swaps) => swaps,
            Err(error) => {
                tracing::error!("cannot load swaps for restore: {:#}", error);
                return;
            }
        };

        for swap in swaps {
            if !swap.is_active() {
                continue;
            }
            let id = swap.id;
            if let Err(error) = self.restore_swap(swap).await {
                tracing::error!(swap_id = %id, "restore failed: {:#}", error);
            }
        }
    }

    async fn restore_swap(&self, mut swap: Swap) -> anyhow::Result<()> {
        let _guard = self.locks.acquire(swap.id).await?;
        let before = swap.progress.clone();

        if swap.secret_hash.is_none() {
            // Negotiation never completed; ask the counterpart service
            // where the swap stands.
            self.messages.send_status_request(swap.id).await?;
            return Ok(());
        }

        self.currency(&swap.sold_currency)?
            .restore_sold(&mut swap)
            .await?;
        self.currency(&swap.purchased_currency)?
            .restore_purchased(&mut swap)
            .await?;

        self.commit(&swap, &before).await
    }

    /// Cancels swaps past their payment deadline with nothing at stake on
    /// either side.
    async fn sweep_timeouts(&self) -> anyhow::Result<()> {
        for swap in self.repository.all().await? {
            if !swap.is_active()
                || swap.progress.contains(StateFlag::IsPaymentBroadcast)
                || swap.progress.contains(StateFlag::IsRedeemBroadcast)
                || !swap.payment_deadline(&self.config).has_passed()
            {
                continue;
            }

            let _guard = self.locks.acquire(swap.id).await?;
            let mut swap = match self.repository.swap(swap.id).await? {
                Some(swap) => swap,
                None => continue,
            };
            let before = swap.progress.clone();
            if swap.progress.contains(StateFlag::IsPaymentBroadcast) {
                continue;
            }

            tracing::warn!(swap_id = %swap.id, "swap timed out before any payment");
            swap.progress.add(StateFlag::IsCanceled);
            self.commit(&swap, &before).await?;
        }
        Ok(())
    }

    /// Persists the record and broadcasts one update per newly-set flag.
    async fn commit(&self, swap: &Swap, before: &Progress) -> anyhow::Result<()> {
        self.repository.update(swap).await?;
        for flag in swap.progress.since(before) {
            let _ = self.updates.send(SwapUpdate { id: swap.id, flag });
        }
        Ok(())
    }

    fn currency(&self, name: &str) -> Result<&Arc<dyn CurrencySwap>, Error> {
        self.currencies
            .get(name)
            .ok_or_else(|| Error::UnknownCurrency(name.to_string()))
    }
}

impl std::fmt::Debug for SwapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapManager")
            .field("currencies", &self.currencies.keys())
            .finish_non_exhaustive()
    }
}
