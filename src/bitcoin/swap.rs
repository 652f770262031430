//! Bitcoin-family implementation of the currency-swap strategy: payment,
//! redeem with replacement, refund with forced rebroadcast and the on-chain
//! watchers feeding the manager's event loop.

use crate::{
    api::{AddressRepository, BlockchainApi, ConfirmationStatus},
    bitcoin::{
        htlc::{self, Htlc},
        signer::SwapSigner,
        transaction::{next_redeem_sequence, TransactionFactory},
    },
    config::Config,
    currency::CurrencySwap,
    error::Error,
    event::SwapEvent,
    supervisor::{Supervisor, WatcherKind},
    swap::{StateFlag, SwapId},
    Swap, Timestamp,
};
use ::bitcoin::{Address, Amount, Sequence, Txid};
use anyhow::Context;
use std::sync::Arc;

pub struct BitcoinSwap {
    currency: String,
    config: Config,
    chain: Arc<dyn BlockchainApi>,
    addresses: Arc<dyn AddressRepository>,
    signer: SwapSigner,
    factory: TransactionFactory,
    events: tokio::sync::mpsc::Sender<SwapEvent>,
    supervisor: Arc<Supervisor>,
}

impl BitcoinSwap {
    pub fn new(
        currency: impl Into<String>,
        config: Config,
        chain: Arc<dyn BlockchainApi>,
        addresses: Arc<dyn AddressRepository>,
        signer: SwapSigner,
        events: tokio::sync::mpsc::Sender<SwapEvent>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        let factory = TransactionFactory::new(config.clone());
        Self {
            currency: currency.into(),
            config,
            chain,
            addresses,
            signer,
            factory,
            events,
            supervisor,
        }
    }

    /// Our own contract: refundable by us, redeemable by the counterparty.
    fn own_htlc(&self, swap: &Swap) -> anyhow::Result<Htlc> {
        let secret_hash = swap.secret_hash.ok_or(Error::InvalidSecretHash)?;
        let refund_address = swap.refund_address.as_ref().ok_or(Error::InvalidWallets)?;
        let party_address = swap.party_address.as_ref().ok_or(Error::InvalidWallets)?;

        Ok(Htlc::new(
            refund_address,
            party_address,
            swap.lock_time(&self.config),
            secret_hash,
            self.config.secret_size,
        )?)
    }

    /// The counterparty's contract: refundable by them, redeemable by us.
    fn party_htlc(&self, swap: &Swap) -> anyhow::Result<Htlc> {
        let secret_hash = swap.secret_hash.ok_or(Error::InvalidSecretHash)?;
        let party_refund = swap
            .party_refund_address
            .as_ref()
            .ok_or(Error::InvalidWallets)?;
        let to_address = swap.to_address.as_ref().ok_or(Error::InvalidWallets)?;

        Ok(Htlc::new(
            party_refund,
            to_address,
            swap.party_lock_time(&self.config),
            secret_hash,
            self.config.secret_size,
        )?)
    }

    /// Latest time by which the counterparty's payment must have appeared.
    fn party_payment_deadline(&self, swap: &Swap) -> Timestamp {
        if swap.is_initiator {
            swap.redeem_deadline(&self.config)
        } else {
            swap.timestamp.plus(self.config.max_swap_timeout)
        }
    }

    fn redeem_is_stale(&self, swap: &Swap) -> bool {
        match swap.redeem_broadcast_at {
            Some(at) => at
                .plus(self.config.redeem_staleness.as_secs() as u32)
                .has_passed(),
            None => false,
        }
    }

    fn watch_payment_confirmation(&self, id: SwapId, txid: Txid) {
        let chain = self.chain.clone();
        let events = self.events.clone();
        let poll = self.config.confirmation_poll_interval;

        self.supervisor
            .spawn(id, WatcherKind::PaymentConfirmation, async move {
                loop {
                    if let ConfirmationStatus::Confirmed(_) =
                        chain.confirmation_status(txid).await?
                    {
                        let _ = events.send(SwapEvent::PaymentConfirmed { id }).await;
                        return Ok(());
                    }
                    tokio::time::sleep(poll).await;
                }
            });
    }

    fn watch_redeem(&self, swap: &Swap, txid: Txid) {
        let chain = self.chain.clone();
        let events = self.events.clone();
        let poll = self.config.confirmation_poll_interval;
        let staleness = self.config.redeem_staleness.as_secs() as u32;
        let broadcast_at = swap.redeem_broadcast_at.unwrap_or_else(Timestamp::now);
        let id = swap.id;

        self.supervisor
            .spawn(id, WatcherKind::RedeemConfirmation, async move {
                loop {
                    match chain.confirmation_status(txid).await? {
                        ConfirmationStatus::Confirmed(_) => {
                            let _ = events.send(SwapEvent::RedeemConfirmed { id }).await;
                            return Ok(());
                        }
                        ConfirmationStatus::NotFound => {
                            let _ = events.send(SwapEvent::RedeemEvicted { id }).await;
                            return Ok(());
                        }
                        ConfirmationStatus::Pending => {
                            if broadcast_at.plus(staleness).has_passed() {
                                let _ = events.send(SwapEvent::RedeemEvicted { id }).await;
                                return Ok(());
                            }
                        }
                    }
                    tokio::time::sleep(poll).await;
                }
            });
    }

    async fn wallet_outputs(&self) -> anyhow::Result<Vec<crate::api::Utxo>> {
        let mut outputs = Vec::new();
        for address in self.addresses.known_addresses().await? {
            outputs.extend(self.chain.unspent_outputs(&address).await?);
        }
        Ok(outputs)
    }
}

#[async_trait::async_trait]
impl CurrencySwap for BitcoinSwap {
    fn currency(&self) -> &str {
        &self.currency
    }

    async fn pay(&self, swap: &mut Swap) -> anyhow::Result<()> {
        if swap.progress.contains(StateFlag::IsPaymentBroadcast) {
            tracing::debug!(swap_id = %swap.id, "payment already broadcast");
            return Ok(());
        }
        if swap.payment_deadline(&self.config).has_passed() {
            tracing::warn!(swap_id = %swap.id, "payment deadline passed");
            let _ = self.events.send(SwapEvent::Canceled { id: swap.id }).await;
            return Ok(());
        }
        if !swap.is_initiator && !swap.progress.contains(StateFlag::IsPartyPaymentConfirmed) {
            tracing::debug!(swap_id = %swap.id, "waiting for the counterparty's payment");
            return Ok(());
        }

        let secret_hash = swap.secret_hash.ok_or(Error::InvalidSecretHash)?;
        let refund_address = swap.refund_address.clone().ok_or(Error::InvalidWallets)?;
        let party_address = swap.party_address.clone().ok_or(Error::InvalidWallets)?;

        // A crash after broadcast but before the flags were persisted leaves
        // no trace in the record; the payment may already be on-chain.
        let contract = self.own_htlc(swap)?;
        if let Some((transaction, _)) = self.chain.find_output_by_script(contract.script()).await? {
            let txid = transaction.txid();
            tracing::info!(swap_id = %swap.id, %txid, "adopting our payment found on-chain");
            swap.payment_tx_id = Some(txid);
            swap.payment_tx = Some(transaction);
            swap.progress.add(StateFlag::IsPaymentSigned);
            swap.progress.add(StateFlag::IsPaymentBroadcast);
            self.watch_payment_confirmation(swap.id, txid);
            return Ok(());
        }

        let outputs = self.wallet_outputs().await?;
        let fee_rate = self.chain.fee_rate().await?.max(self.config.min_fee_rate);

        let mut payment = self.factory.create_payment(
            &outputs,
            swap.qty,
            &refund_address,
            &party_address,
            swap.lock_time(&self.config),
            secret_hash,
            self.config.secret_size,
            fee_rate,
        )?;
        self.signer.sign_payment(&mut payment).await?;

        let txid = payment.transaction.txid();
        swap.payment_tx_id = Some(txid);
        swap.payment_tx = Some(payment.transaction.clone());
        swap.progress.add(StateFlag::IsPaymentSigned);

        self.chain
            .broadcast(&payment.transaction)
            .await
            .context(Error::Broadcast(swap.id))?;
        swap.progress.add(StateFlag::IsPaymentBroadcast);
        tracing::info!(swap_id = %swap.id, %txid, "payment broadcast");

        self.watch_payment_confirmation(swap.id, txid);
        Ok(())
    }

    async fn redeem(&self, swap: &mut Swap) -> anyhow::Result<()> {
        if swap.progress.contains(StateFlag::IsRedeemConfirmed) {
            return Ok(());
        }

        // An earlier redeem may still be in flight, confirmed, or gone.
        let mut replacing = false;
        if swap.progress.contains(StateFlag::IsRedeemBroadcast) {
            if let Some(txid) = swap.redeem_tx_id {
                match self.chain.confirmation_status(txid).await? {
                    ConfirmationStatus::Confirmed(_) => {
                        swap.progress.add(StateFlag::IsRedeemConfirmed);
                        return Ok(());
                    }
                    ConfirmationStatus::Pending => {
                        if !self.redeem_is_stale(swap) {
                            self.watch_redeem(swap, txid);
                            return Ok(());
                        }
                        replacing = true;
                    }
                    ConfirmationStatus::NotFound => replacing = true,
                }
            }
        }

        if !replacing && swap.is_initiator && swap.redeem_deadline(&self.config).has_passed() {
            tracing::warn!(
                swap_id = %swap.id,
                "too close to the counterparty's deadline for a fresh redeem"
            );
            return Ok(());
        }

        let secret = swap
            .secret
            .ok_or_else(|| anyhow::anyhow!("no secret to redeem with"))?;
        let to_address = swap.to_address.clone().ok_or(Error::InvalidWallets)?;

        if swap.party_payment_tx.is_none() && !self.try_to_find_payment(swap).await? {
            anyhow::bail!("counterparty payment transaction not found");
        }
        let party_tx = swap
            .party_payment_tx
            .clone()
            .ok_or_else(|| anyhow::anyhow!("counterparty payment transaction missing"))?;

        let contract = self.party_htlc(swap)?;
        let vout = contract.find_output(&party_tx).ok_or_else(|| {
            Error::TransactionCreation("counterparty payment has no htlc output".to_string())
        })?;
        let amount = Amount::from_sat(party_tx.output[vout].value);

        let sequence = match (&swap.redeem_tx, replacing) {
            (Some(previous), true) => next_redeem_sequence(previous.input[0].sequence),
            _ => Sequence::ZERO,
        };
        let fee_rate = self.chain.fee_rate().await?;

        let mut redeem =
            self.factory
                .create_redeem(&party_tx, amount, &to_address, &contract, sequence, fee_rate)?;
        self.signer
            .sign_redeem(&mut redeem, &contract, secret, &to_address)
            .await?;

        let txid = redeem.txid();
        swap.redeem_tx_id = Some(txid);
        swap.redeem_tx = Some(redeem.clone());
        swap.progress.add(StateFlag::IsRedeemSigned);

        self.chain
            .broadcast(&redeem)
            .await
            .context(Error::Broadcast(swap.id))?;
        swap.progress.add(StateFlag::IsRedeemBroadcast);
        swap.redeem_broadcast_at = Some(Timestamp::now());
        tracing::info!(swap_id = %swap.id, %txid, ?sequence, "redeem broadcast");

        self.watch_redeem(swap, txid);
        Ok(())
    }

    async fn refund(&self, swap: &mut Swap) -> anyhow::Result<()> {
        if swap.progress.contains(StateFlag::IsRefundConfirmed) {
            return Ok(());
        }

        let payment_tx = swap
            .payment_tx
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no payment transaction to refund"))?;
        let refund_address = swap.refund_address.clone().ok_or(Error::InvalidWallets)?;
        let contract = self.own_htlc(swap)?;

        if swap.refund_tx.is_none() {
            let vout = contract.find_output(&payment_tx).ok_or_else(|| {
                Error::TransactionCreation("payment has no htlc output".to_string())
            })?;
            let amount = Amount::from_sat(payment_tx.output[vout].value);
            let fee_rate = self.chain.fee_rate().await?;

            let mut refund = self.factory.create_refund(
                &payment_tx,
                amount,
                &refund_address,
                &contract,
                contract.unlock_time(),
                fee_rate,
            )?;
            self.signer
                .sign_refund(&mut refund, &contract, &refund_address)
                .await?;

            swap.refund_tx_id = Some(refund.txid());
            swap.refund_tx = Some(refund);
            swap.progress.add(StateFlag::IsRefundSigned);
        }

        let refund = swap
            .refund_tx
            .clone()
            .ok_or_else(|| anyhow::anyhow!("refund transaction missing"))?;
        let chain = self.chain.clone();
        let events = self.events.clone();
        let interval = self.config.rebroadcast_interval;
        let id = swap.id;

        // Rebroadcast until the node accepts and confirms it. Rejections
        // before the lock time are expected and retried.
        self.supervisor
            .spawn(id, WatcherKind::RefundRebroadcast, async move {
                let txid = refund.txid();
                loop {
                    if let ConfirmationStatus::Confirmed(_) =
                        chain.confirmation_status(txid).await?
                    {
                        let _ = events.send(SwapEvent::RefundConfirmed { id }).await;
                        return Ok(());
                    }
                    match chain.broadcast(&refund).await {
                        Ok(txid) => {
                            let _ = events.send(SwapEvent::RefundBroadcast { id, txid }).await;
                        }
                        Err(error) => {
                            tracing::debug!(swap_id = %id, "refund broadcast rejected: {:#}", error);
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            });

        Ok(())
    }

    async fn start_party_payment_control(&self, swap: &Swap) -> anyhow::Result<()> {
        let contract = self.party_htlc(swap)?;
        let script = contract.script().clone();
        let deadline = self.party_payment_deadline(swap);
        let chain = self.chain.clone();
        let events = self.events.clone();
        let poll = self.config.confirmation_poll_interval;
        let id = swap.id;

        self.supervisor
            .spawn(id, WatcherKind::PartyPayment, async move {
                loop {
                    if let Some((transaction, _)) = chain.find_output_by_script(&script).await? {
                        let txid = transaction.txid();
                        let _ = events
                            .send(SwapEvent::PartyPaymentDetected { id, transaction })
                            .await;

                        loop {
                            if let ConfirmationStatus::Confirmed(_) =
                                chain.confirmation_status(txid).await?
                            {
                                let _ = events.send(SwapEvent::PartyPaymentConfirmed { id }).await;
                                return Ok(());
                            }
                            tokio::time::sleep(poll).await;
                        }
                    }
                    if deadline.has_passed() {
                        tracing::warn!(swap_id = %id, "counterparty never paid");
                        let _ = events.send(SwapEvent::Canceled { id }).await;
                        return Ok(());
                    }
                    tokio::time::sleep(poll).await;
                }
            });

        Ok(())
    }

    async fn start_wait_for_redeem(&self, swap: &Swap) -> anyhow::Result<()> {
        let payment_tx = swap
            .payment_tx
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no payment transaction to watch"))?;
        let contract = self.own_htlc(swap)?;
        let vout = contract.find_output(&payment_tx).ok_or_else(|| {
            Error::TransactionCreation("payment has no htlc output".to_string())
        })? as u32;

        let txid = payment_tx.txid();
        let secret_hash = contract.secret_hash();
        let secret_size = contract.secret_size();
        let deadline = contract.unlock_time();
        let chain = self.chain.clone();
        let events = self.events.clone();
        let poll = self.config.confirmation_poll_interval;
        let id = swap.id;

        self.supervisor
            .spawn(id, WatcherKind::SpentOutput, async move {
                loop {
                    if let Some(spent) = chain.spent_point(txid, vout).await? {
                        let input = spent
                            .spending_tx
                            .input
                            .get(spent.input_index as usize)
                            .ok_or(Error::InvalidSpentPoint)?;

                        let event = if let Some(secret) =
                            htlc::extract_secret(&spent.spending_tx, &secret_hash, secret_size)
                        {
                            SwapEvent::PaymentSpent { id, secret }
                        } else if htlc::is_refund_spend(&input.script_sig) {
                            SwapEvent::PaymentRefunded { id }
                        } else {
                            SwapEvent::SpentPointInvalid { id }
                        };
                        let _ = events.send(event).await;
                        return Ok(());
                    }
                    if deadline.has_passed() {
                        let _ = events.send(SwapEvent::RefundTimeElapsed { id }).await;
                        return Ok(());
                    }
                    tokio::time::sleep(poll).await;
                }
            });

        if !swap.progress.contains(StateFlag::IsPaymentConfirmed) {
            self.watch_payment_confirmation(swap.id, txid);
        }

        Ok(())
    }

    async fn try_to_find_payment(&self, swap: &mut Swap) -> anyhow::Result<bool> {
        let contract = self.party_htlc(swap)?;
        match self.chain.find_output_by_script(contract.script()).await? {
            Some((transaction, _)) => {
                tracing::info!(
                    swap_id = %swap.id,
                    txid = %transaction.txid(),
                    "found counterparty payment"
                );
                swap.party_payment_tx = Some(transaction);
                swap.progress.add(StateFlag::HasPartyPayment);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn restore_sold(&self, swap: &mut Swap) -> anyhow::Result<()> {
        if !swap.is_active() {
            return Ok(());
        }

        if swap.progress.contains(StateFlag::IsRefundSigned)
            && !swap.progress.contains(StateFlag::IsRefundConfirmed)
        {
            return self.refund(swap).await;
        }

        if swap.progress.contains(StateFlag::IsPaymentBroadcast) {
            // A broadcast payment may have been evicted while we were down.
            if !swap.progress.contains(StateFlag::IsPaymentConfirmed) {
                if let Some(txid) = swap.payment_tx_id {
                    if let ConfirmationStatus::NotFound =
                        self.chain.confirmation_status(txid).await?
                    {
                        if swap.payment_deadline(&self.config).has_passed() {
                            tracing::warn!(
                                swap_id = %swap.id,
                                %txid,
                                "payment vanished and the deadline passed, canceling"
                            );
                            swap.progress.add(StateFlag::IsCanceled);
                            return Ok(());
                        }
                        let payment = swap
                            .payment_tx
                            .clone()
                            .ok_or_else(|| anyhow::anyhow!("no payment transaction to rebroadcast"))?;
                        self.chain
                            .broadcast(&payment)
                            .await
                            .context(Error::Broadcast(swap.id))?;
                        tracing::info!(swap_id = %swap.id, %txid, "rebroadcast evicted payment");
                    }
                }
            }
            return self.start_wait_for_redeem(swap).await;
        }

        self.pay(swap).await
    }

    async fn restore_purchased(&self, swap: &mut Swap) -> anyhow::Result<()> {
        if !swap.is_active() {
            return Ok(());
        }

        if swap.progress.contains(StateFlag::IsRedeemBroadcast) {
            // Re-checks the old redeem and replaces it if it vanished.
            self.redeem(swap).await
        } else if swap.progress.contains(StateFlag::HasSecret)
            && swap.progress.contains(StateFlag::IsPartyPaymentConfirmed)
        {
            self.redeem(swap).await
        } else if !swap.progress.contains(StateFlag::IsPartyPaymentConfirmed) {
            self.start_party_payment_control(swap).await
        } else {
            Ok(())
        }
    }

    async fn free_address(&self) -> anyhow::Result<Address> {
        self.addresses.free_address().await
    }

    async fn reward_for_redeem(&self, redeem_address: &Address) -> anyhow::Result<Amount> {
        if self.config.utxo_fee_less {
            return Ok(Amount::ZERO);
        }
        let balance = self.chain.balance(redeem_address).await?;
        if balance >= self.config.default_redeem_fee {
            Ok(Amount::ZERO)
        } else {
            Ok(self.config.default_redeem_fee)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::SpentPoint,
        test_support::{keypair, swap_stub, LocalSigner, StaticAddresses, StaticBlockchain},
        Secret, SecretHash,
    };
    use ::bitcoin::blockdata::script::Builder;
    use tokio::sync::mpsc;

    fn secret() -> Secret {
        Secret::from(*b"hello world, you are beautiful!!")
    }

    struct Harness {
        swap: BitcoinSwap,
        chain: Arc<StaticBlockchain>,
        events: mpsc::Receiver<SwapEvent>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::channel(32);
        let chain = Arc::new(StaticBlockchain::new(2));
        let (_, _, our_address) = keypair(1);
        let addresses = Arc::new(StaticAddresses::new(vec![our_address]));
        let supervisor = Arc::new(Supervisor::new(tx.clone()));

        Harness {
            swap: BitcoinSwap::new(
                "BTC",
                Config::regtest(),
                chain.clone(),
                addresses,
                SwapSigner::new(Arc::new(LocalSigner::new())),
                tx,
                supervisor,
            ),
            chain,
            events: rx,
        }
    }

    /// A funded swap record where we sell BTC as initiator.
    fn funded_swap(harness: &Harness, is_initiator: bool) -> Swap {
        let (_, _, our_address) = keypair(1);
        let (_, _, party_address) = keypair(2);

        let mut swap = swap_stub(SwapId(1), is_initiator);
        swap.pin_secret_hash(SecretHash::new(secret())).unwrap();
        swap.refund_address = Some(our_address.clone());
        swap.to_address = Some(our_address.clone());
        swap.party_address = Some(party_address.clone());
        swap.party_refund_address = Some(party_address);

        harness
            .chain
            .fund(&our_address, Amount::from_btc(1.0).unwrap());
        swap
    }

    #[tokio::test]
    async fn acceptor_does_not_pay_before_party_payment_confirms() {
        let h = harness();
        let mut swap = funded_swap(&h, false);

        h.swap.pay(&mut swap).await.unwrap();

        assert!(!swap.progress.contains(StateFlag::IsPaymentSigned));
        assert!(h.chain.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn initiator_payment_is_signed_broadcast_and_watched() {
        let mut h = harness();
        let mut swap = funded_swap(&h, true);

        h.swap.pay(&mut swap).await.unwrap();

        assert!(swap.progress.contains(StateFlag::IsPaymentSigned));
        assert!(swap.progress.contains(StateFlag::IsPaymentBroadcast));
        let broadcasts = h.chain.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(swap.payment_tx_id, Some(broadcasts[0].txid()));

        // the chain confirms broadcasts immediately, so the watcher reports
        match h.events.recv().await {
            Some(SwapEvent::PaymentConfirmed { id }) => assert_eq!(id, swap.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn paying_twice_broadcasts_once() {
        let h = harness();
        let mut swap = funded_swap(&h, true);

        h.swap.pay(&mut swap).await.unwrap();
        h.swap.pay(&mut swap).await.unwrap();

        assert_eq!(h.chain.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn pay_adopts_a_payment_already_on_chain() {
        let h = harness();
        let mut swap = funded_swap(&h, true);

        // an earlier run broadcast the payment but crashed before the
        // record was persisted
        let contract = h.swap.own_htlc(&swap).unwrap();
        let payment = crate::test_support::transaction_paying(contract.script(), 100_000);
        h.chain.seed_output(contract.script(), &payment, 0);

        h.swap.pay(&mut swap).await.unwrap();

        assert!(swap.progress.contains(StateFlag::IsPaymentBroadcast));
        assert_eq!(swap.payment_tx_id, Some(payment.txid()));
        // no second payment hits the chain
        assert!(h.chain.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn restore_cancels_a_vanished_payment_past_the_deadline() {
        let h = harness();
        let mut swap = funded_swap(&h, true);
        h.swap.pay(&mut swap).await.unwrap();

        h.chain.forget(swap.payment_tx_id.unwrap());
        swap.timestamp = Timestamp::from(1_600_000_000);

        h.swap.restore_sold(&mut swap).await.unwrap();

        assert!(swap.progress.contains(StateFlag::IsCanceled));
        assert!(!swap.is_active());
    }

    #[tokio::test]
    async fn restore_rebroadcasts_an_evicted_payment_still_in_time() {
        let h = harness();
        let mut swap = funded_swap(&h, true);
        h.swap.pay(&mut swap).await.unwrap();
        assert_eq!(h.chain.broadcasts().len(), 1);

        h.chain.forget(swap.payment_tx_id.unwrap());

        h.swap.restore_sold(&mut swap).await.unwrap();

        assert_eq!(h.chain.broadcasts().len(), 2);
        assert!(swap.is_active());
    }

    #[tokio::test]
    async fn finds_the_counterparty_payment_by_script() {
        let h = harness();
        let mut swap = funded_swap(&h, true);

        // counterparty pays into the contract we expect
        let contract = h.swap.party_htlc(&swap).unwrap();
        let payment = crate::test_support::transaction_paying(contract.script(), 50_000);
        h.chain.seed_output(contract.script(), &payment, 0);

        assert!(h.swap.try_to_find_payment(&mut swap).await.unwrap());
        assert!(swap.progress.contains(StateFlag::HasPartyPayment));
        assert_eq!(swap.party_payment_tx.unwrap().txid(), payment.txid());
    }

    #[tokio::test]
    async fn redeem_claims_the_counterparty_payment() {
        let h = harness();
        let mut swap = funded_swap(&h, false);
        swap.set_secret(secret()).unwrap();
        swap.progress.add(StateFlag::IsPartyPaymentConfirmed);

        let contract = h.swap.party_htlc(&swap).unwrap();
        let payment = crate::test_support::transaction_paying(contract.script(), 1_000_000);
        h.chain.seed_output(contract.script(), &payment, 0);

        h.swap.redeem(&mut swap).await.unwrap();

        assert!(swap.progress.contains(StateFlag::IsRedeemSigned));
        assert!(swap.progress.contains(StateFlag::IsRedeemBroadcast));
        let redeem = swap.redeem_tx.unwrap();
        assert_eq!(redeem.input[0].sequence, Sequence::ZERO);
        assert!(htlc::is_redeem_spend(&redeem.input[0].script_sig));
    }

    #[tokio::test]
    async fn evicted_redeem_is_replaced_with_a_bumped_sequence() {
        let h = harness();
        let mut swap = funded_swap(&h, false);
        swap.set_secret(secret()).unwrap();
        swap.progress.add(StateFlag::IsPartyPaymentConfirmed);

        let contract = h.swap.party_htlc(&swap).unwrap();
        let payment = crate::test_support::transaction_paying(contract.script(), 1_000_000);
        h.chain.seed_output(contract.script(), &payment, 0);

        h.swap.redeem(&mut swap).await.unwrap();
        let first = swap.redeem_tx.clone().unwrap();

        // the mempool forgot the first redeem
        h.chain.forget(first.txid());
        h.swap.redeem(&mut swap).await.unwrap();

        let second = swap.redeem_tx.unwrap();
        assert_ne!(second.txid(), first.txid());
        assert_eq!(
            second.input[0].sequence,
            next_redeem_sequence(first.input[0].sequence)
        );
    }

    #[tokio::test]
    async fn spent_htlc_output_reveals_the_secret() {
        let mut h = harness();
        let mut swap = funded_swap(&h, true);
        h.swap.pay(&mut swap).await.unwrap();

        let payment_tx = swap.payment_tx.clone().unwrap();
        let contract = h.swap.own_htlc(&swap).unwrap();
        let vout = contract.find_output(&payment_tx).unwrap() as u32;

        let script_sig = Builder::new()
            .push_slice(&[0u8; 71])
            .push_slice(&[0u8; 33])
            .push_slice(secret().raw_secret())
            .push_int(0)
            .into_script();
        let spending_tx =
            crate::test_support::transaction_spending(payment_tx.txid(), vout, script_sig);
        h.chain.seed_spent(
            payment_tx.txid(),
            vout,
            SpentPoint {
                spending_tx,
                input_index: 0,
            },
        );

        h.swap.start_wait_for_redeem(&swap).await.unwrap();

        loop {
            match h.events.recv().await {
                Some(SwapEvent::PaymentSpent { id, secret: s }) => {
                    assert_eq!(id, swap.id);
                    assert_eq!(s, secret());
                    break;
                }
                Some(SwapEvent::PaymentConfirmed { .. }) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn refund_shaped_spend_is_reported_as_refunded() {
        let mut h = harness();
        let mut swap = funded_swap(&h, true);
        h.swap.pay(&mut swap).await.unwrap();
        swap.progress.add(StateFlag::IsPaymentConfirmed);

        let payment_tx = swap.payment_tx.clone().unwrap();
        let contract = h.swap.own_htlc(&swap).unwrap();
        let vout = contract.find_output(&payment_tx).unwrap() as u32;

        let script_sig = Builder::new()
            .push_slice(&[0u8; 71])
            .push_slice(&[0u8; 33])
            .push_int(1)
            .into_script();
        let spending_tx =
            crate::test_support::transaction_spending(payment_tx.txid(), vout, script_sig);
        h.chain.seed_spent(
            payment_tx.txid(),
            vout,
            SpentPoint {
                spending_tx,
                input_index: 0,
            },
        );

        h.swap.start_wait_for_redeem(&swap).await.unwrap();

        loop {
            match h.events.recv().await {
                Some(SwapEvent::PaymentRefunded { id }) => {
                    assert_eq!(id, swap.id);
                    break;
                }
                Some(SwapEvent::PaymentConfirmed { .. }) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn refund_is_signed_and_rebroadcast_until_confirmed() {
        let mut h = harness();
        let mut swap = funded_swap(&h, true);
        h.swap.pay(&mut swap).await.unwrap();

        h.swap.refund(&mut swap).await.unwrap();

        assert!(swap.progress.contains(StateFlag::IsRefundSigned));
        let refund = swap.refund_tx.clone().unwrap();
        assert!(htlc::is_refund_spend(&refund.input[0].script_sig));

        loop {
            match h.events.recv().await {
                Some(SwapEvent::RefundBroadcast { id, txid }) => {
                    assert_eq!(id, swap.id);
                    assert_eq!(txid, refund.txid());
                }
                Some(SwapEvent::RefundConfirmed { id }) => {
                    assert_eq!(id, swap.id);
                    break;
                }
                Some(SwapEvent::PaymentConfirmed { .. }) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
