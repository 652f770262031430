//! The per-currency-family strategy behind which all swap steps live.
//!
//! One implementation exists per currency family; instances are selected
//! once at manager construction time via a registry keyed by currency name.
//! Steps take `&mut Swap` and are only ever invoked while the manager holds
//! that swap's exclusive lock; watchers spawned by a step communicate back
//! through the event channel instead of touching the swap directly.

use crate::Swap;
use bitcoin::{Address, Amount};

#[async_trait::async_trait]
pub trait CurrencySwap: Send + Sync {
    /// Currency ticker this instance serves, e.g. `"BTC"`.
    fn currency(&self) -> &str;

    /// Broadcasts our HTLC payment. Re-entrant-safe: skips if the payment
    /// was already broadcast, cancels if the payment deadline has passed and
    /// refuses to pay as acceptor before the counterparty's payment is
    /// confirmed.
    async fn pay(&self, swap: &mut Swap) -> anyhow::Result<()>;

    /// Claims the counterparty's HTLC payment with the revealed secret,
    /// replacing an evicted or stale prior redeem with a higher sequence
    /// number.
    async fn redeem(&self, swap: &mut Swap) -> anyhow::Result<()>;

    /// Reclaims our own HTLC payment after its deadline; hands the signed
    /// refund to a force-rebroadcast loop so it eventually lands even under
    /// transient broadcast failures.
    async fn refund(&self, swap: &mut Swap) -> anyhow::Result<()>;

    /// Begins an asynchronous watch for the counterparty's HTLC payment,
    /// bounded by the protocol deadline.
    async fn start_party_payment_control(&self, swap: &Swap) -> anyhow::Result<()>;

    /// Concurrently watches our HTLC output for being spent and tracks our
    /// payment's confirmation.
    async fn start_wait_for_redeem(&self, swap: &Swap) -> anyhow::Result<()>;

    /// Locates the counterparty's payment to the expected HTLC script.
    /// Returns `true` and records the transaction on the swap if found.
    async fn try_to_find_payment(&self, swap: &mut Swap) -> anyhow::Result<bool>;

    /// Replays the correct next step for the sold-currency leg after a
    /// restart. Idempotent.
    async fn restore_sold(&self, swap: &mut Swap) -> anyhow::Result<()>;

    /// Replays the correct next step for the purchased-currency leg after a
    /// restart. Idempotent.
    async fn restore_purchased(&self, swap: &mut Swap) -> anyhow::Result<()>;

    /// A fresh wallet address for redeem/refund outputs.
    async fn free_address(&self) -> anyhow::Result<Address>;

    /// Reward offered to a third-party redeemer: non-zero only when the
    /// balance behind `redeem_address` cannot cover the family's default
    /// redeem fee and the family is not fee-less.
    async fn reward_for_redeem(&self, redeem_address: &Address) -> anyhow::Result<Amount>;
}
