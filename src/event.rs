//! Events flowing from currency swaps and background watchers into the
//! manager's single event loop. Watchers never mutate a swap themselves;
//! every mutation funnels through the manager's locking path.

use crate::{
    swap::{StateFlag, SwapId},
    Secret,
};
use bitcoin::{Transaction, Txid};

/// Observation reported by a currency swap step or one of its watchers.
#[derive(Clone, Debug, strum::Display)]
pub enum SwapEvent {
    /// The counterparty's HTLC payment appeared on-chain.
    PartyPaymentDetected { id: SwapId, transaction: Transaction },
    /// The counterparty's payment reached confirmation.
    PartyPaymentConfirmed { id: SwapId },
    /// Our own payment reached confirmation.
    PaymentConfirmed { id: SwapId },
    /// Our HTLC output was spent via the redeem path, revealing the secret.
    PaymentSpent { id: SwapId, secret: Secret },
    /// Our HTLC output was spent via the refund path.
    PaymentRefunded { id: SwapId },
    /// Our HTLC deadline elapsed with the output still unspent.
    RefundTimeElapsed { id: SwapId },
    /// Our redeem reached confirmation.
    RedeemConfirmed { id: SwapId },
    /// Our broadcast redeem vanished from the network or went stale; a
    /// replacement with a bumped sequence number is due.
    RedeemEvicted { id: SwapId },
    /// The refund rebroadcast loop managed a broadcast.
    RefundBroadcast { id: SwapId, txid: Txid },
    /// Our refund reached confirmation.
    RefundConfirmed { id: SwapId },
    /// The counterparty never paid within the protocol deadline.
    Canceled { id: SwapId },
    /// The HTLC output was spent by a script that is neither a redeem nor a
    /// refund; fatal for this swap.
    SpentPointInvalid { id: SwapId },
    /// A supervised background task failed; the swap stays in its last
    /// valid state for the next restore pass.
    StepFailed { id: SwapId, error: String },
}

impl SwapEvent {
    pub fn swap_id(&self) -> SwapId {
        match self {
            SwapEvent::PartyPaymentDetected { id, .. }
            | SwapEvent::PartyPaymentConfirmed { id }
            | SwapEvent::PaymentConfirmed { id }
            | SwapEvent::PaymentSpent { id, .. }
            | SwapEvent::PaymentRefunded { id }
            | SwapEvent::RefundTimeElapsed { id }
            | SwapEvent::RedeemConfirmed { id }
            | SwapEvent::RedeemEvicted { id }
            | SwapEvent::RefundBroadcast { id, .. }
            | SwapEvent::RefundConfirmed { id }
            | SwapEvent::Canceled { id }
            | SwapEvent::SpentPointInvalid { id }
            | SwapEvent::StepFailed { id, .. } => *id,
        }
    }
}

/// Fired on every `state_flags` change; consumed by persistence and by
/// UI/telemetry subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapUpdate {
    pub id: SwapId,
    pub flag: StateFlag,
}
