//! Supervised task spawning.
//!
//! Every background operation (confirmation watcher, spent-output watcher,
//! rebroadcast loop) is tracked by a handle so shutdown can cancel it, and
//! failures surface as [`SwapEvent::StepFailed`] instead of disappearing
//! into a logged-and-forgotten task. Watchers are keyed by swap and kind,
//! so re-running a swap step never accumulates duplicate pollers.

use crate::{event::SwapEvent, swap::SwapId};
use std::{collections::HashMap, fmt, future::Future, sync::Mutex};
use tokio::{sync::mpsc, task::JoinHandle};

/// The kinds of background watcher a swap can have. At most one of each
/// kind runs per swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatcherKind {
    PaymentConfirmation,
    RedeemConfirmation,
    RefundRebroadcast,
    PartyPayment,
    SpentOutput,
}

pub struct Supervisor {
    events: mpsc::Sender<SwapEvent>,
    watchers: Mutex<HashMap<(SwapId, WatcherKind), JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(events: mpsc::Sender<SwapEvent>) -> Self {
        Self {
            events,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a watcher on behalf of `swap_id` unless one of the same kind
    /// is still running for that swap. An `Err` outcome is reported through
    /// the event channel; cancellation via [`Supervisor::shutdown`] simply
    /// drops the future. Returns whether a new task was spawned.
    pub fn spawn<F>(&self, swap_id: SwapId, kind: WatcherKind, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut watchers = match self.watchers.lock() {
            Ok(watchers) => watchers,
            Err(_) => return false,
        };
        if let Some(running) = watchers.get(&(swap_id, kind)) {
            if !running.is_finished() {
                tracing::debug!(%swap_id, ?kind, "watcher already running");
                return false;
            }
        }

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            if let Err(error) = task.await {
                tracing::warn!(%swap_id, ?kind, "background task failed: {:#}", error);
                let _ = events
                    .send(SwapEvent::StepFailed {
                        id: swap_id,
                        error: format!("{:#}", error),
                    })
                    .await;
            }
        });

        watchers.retain(|_, task| !task.is_finished());
        watchers.insert((swap_id, kind), handle);
        true
    }

    /// Aborts every task still running. In-flight broadcasts and polls are
    /// dropped, which they must treat as "stop, do not error".
    pub fn shutdown(&self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            for (_, task) in watchers.drain() {
                task.abort();
            }
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .watchers
            .lock()
            .map(|watchers| watchers.len())
            .unwrap_or(0);
        f.debug_struct("Supervisor")
            .field("watchers", &running)
            .finish()
    }
}
