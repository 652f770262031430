use crate::Secret;
use bitcoin::{Amount, Network};
use std::time::Duration;

/// Currency family parameters: network, lock-time constants, fee policy and
/// polling intervals. Consumed read-only by the swap components.
#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    /// Seconds the initiator's HTLC stays locked.
    pub initiator_lock_time: u32,
    /// Seconds the acceptor's HTLC stays locked; always shorter than the
    /// initiator's so the acceptor can refund first.
    pub acceptor_lock_time: u32,
    /// How long the initiator may take to broadcast its payment before the
    /// swap is canceled.
    pub max_swap_timeout: u32,
    /// Margin subtracted from the acceptor lock time to form the acceptor's
    /// payment deadline.
    pub payment_time_reserve: u32,
    /// Margin before the counterparty lock time after which building a new
    /// redeem is refused.
    pub redeem_time_reserve: u32,
    /// Fee-rate floor in satoshi per virtual byte. `create_payment` never
    /// produces a transaction priced below this.
    pub min_fee_rate: u64,
    /// Flat fee assumed for a redeem when computing reward-for-redeem.
    pub default_redeem_fee: Amount,
    /// Secret preimage size enforced by the HTLC script.
    pub secret_size: usize,
    /// True for families whose redeem costs nothing (no reward needed).
    pub utxo_fee_less: bool,
    pub confirmation_poll_interval: Duration,
    pub rebroadcast_interval: Duration,
    pub timeout_sweep_interval: Duration,
    /// How long an unconfirmed redeem may linger before it is considered
    /// evicted and replaced.
    pub redeem_staleness: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            initiator_lock_time: 10 * 60 * 60,
            acceptor_lock_time: 5 * 60 * 60,
            max_swap_timeout: 60 * 60,
            payment_time_reserve: 30 * 60,
            redeem_time_reserve: 60 * 60,
            min_fee_rate: 1,
            default_redeem_fee: Amount::from_sat(20_000),
            secret_size: Secret::SIZE,
            utxo_fee_less: false,
            confirmation_poll_interval: Duration::from_secs(60),
            rebroadcast_interval: Duration::from_secs(60),
            timeout_sweep_interval: Duration::from_secs(60),
            redeem_staleness: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl Config {
    #[cfg(test)]
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            confirmation_poll_interval: Duration::from_millis(10),
            rebroadcast_interval: Duration::from_millis(10),
            timeout_sweep_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }
}
