//! Cooperative shutdown signal shared by every polling loop in the
//! orchestrator: one `trigger()` wakes every `tokio::select!` waiting on a
//! subscribed receiver, and `wait_for_drain` lets the trigger's caller block
//! until the expected number of loops have confirmed they exited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

#[derive(Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Idempotent: the first call flips the flag and broadcasts; later
    /// calls are no-ops.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.trigger.send(());
        }
    }

    /// Called by a loop once it has actually exited, so `wait_for_drain`
    /// can count confirmations rather than guessing from elapsed time.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|n| *n += 1);
    }

    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drain_rx.clone();
        if *rx.borrow() >= expected {
            return DrainResult::Complete(*rx.borrow());
        }
        let wait = async {
            while *rx.borrow() < expected {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => DrainResult::Complete(*rx.borrow()),
            Err(_) => DrainResult::Timeout {
                confirmed: *rx.borrow(),
                expected,
            },
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII helper: a loop holds one of these for its lifetime and its `Drop`
/// confirms drain automatically, so an early `return`/`?` still counts.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_is_idempotent_and_wakes_subscribers() {
        let signal = ShutdownSignal::new();
        let mut rx1 = signal.subscribe();
        let mut rx2 = signal.subscribe();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_completes_once_all_confirm() {
        let signal = ShutdownSignal::new();
        signal.confirm_drained();
        signal.confirm_drained();
        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn wait_for_drain_times_out_when_short() {
        let signal = ShutdownSignal::new();
        signal.confirm_drained();
        let result = signal.wait_for_drain(3, Duration::from_millis(20)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 1,
                expected: 3
            }
        );
    }

    #[tokio::test]
    async fn guard_confirms_drain_on_drop() {
        let signal = ShutdownSignal::new();
        {
            let _guard = ShutdownGuard::new(signal.clone());
        }
        let result = signal.wait_for_drain(1, Duration::from_millis(50)).await;
        assert_eq!(result, DrainResult::Complete(1));
    }

    #[tokio::test]
    async fn clone_shares_underlying_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_shutting_down());
    }
}
