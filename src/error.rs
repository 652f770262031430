use crate::{api::OrderId, swap::SwapId};
use bitcoin::Amount;

/// The error taxonomy of the swap engine.
///
/// Protocol violations are recoverable at the swap level: the offending swap
/// is canceled or the step rejected while other swaps keep being served.
/// Construction and signing errors leave the swap in its last valid state so
/// a later restore pass can retry the step.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: Amount,
        required: Amount,
    },
    #[error("transaction creation failed: {0}")]
    TransactionCreation(String),
    #[error("transaction signing failed: {0}")]
    TransactionSigning(String),
    #[error("transaction verification failed: {0}")]
    TransactionVerification(String),
    #[error("counterparty secret hash conflicts with the hash pinned for this swap")]
    InvalidSecretHash,
    #[error("counterparty wallet addresses are missing or malformed")]
    InvalidWallets,
    #[error("counterparty reward for redeem exceeds the swapped amount")]
    InvalidRewardForRedeem,
    #[error("htlc output was spent by a script that is neither a redeem nor a refund")]
    InvalidSpentPoint,
    #[error("broadcast of {0} returned no transaction id")]
    Broadcast(SwapId),
    #[error("originating order {0} is not approved")]
    OrderNotApproved(OrderId),
    #[error("no currency swap registered for {0}")]
    UnknownCurrency(String),
    #[error("swap lock registry is poisoned")]
    LockRegistry,
}
