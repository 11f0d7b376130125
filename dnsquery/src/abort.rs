//! Cancellation shared by every attempt of a query.

use async_std::channel::{bounded, Receiver, Sender};
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner side of an [`AbortSignal`].
#[derive(Clone, Debug)]
pub struct AbortController {
    sender: Sender<()>,
    signal: AbortSignal,
}

/// Observer side, cheap to clone and hand to any number of queries.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    receiver: Receiver<()>,
}

impl AbortController {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(1);
        AbortController {
            sender,
            signal: AbortSignal {
                aborted: Arc::new(AtomicBool::new(false)),
                receiver,
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        if !self.signal.aborted.swap(true, Ordering::SeqCst) {
            // closing wakes every pending `aborted()`
            self.sender.close();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the controller aborts. Never resolves if the controller is
    /// dropped without aborting.
    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        let _ = self.receiver.recv().await;
        if !self.is_aborted() {
            future::pending::<()>().await;
        }
    }
}

/// Waits on an optional signal; without one, waits forever.
pub(crate) async fn wait_aborted(signal: Option<&AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::future::timeout;
    use async_std::task;
    use std::time::Duration;

    #[test]
    fn test_abort_wakes_all_waiters() {
        task::block_on(async {
            let controller = AbortController::new();
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    let signal = controller.signal();
                    task::spawn(async move { signal.aborted().await })
                })
                .collect();
            task::sleep(Duration::from_millis(20)).await;
            controller.abort();
            for waiter in waiters {
                timeout(Duration::from_secs(1), waiter).await.unwrap();
            }
            assert!(controller.signal().is_aborted());
        });
    }

    #[test]
    fn test_dropped_controller_does_not_abort() {
        task::block_on(async {
            let signal = AbortController::new().signal();
            assert!(!signal.is_aborted());
            let waited = timeout(Duration::from_millis(50), signal.aborted()).await;
            assert!(waited.is_err());
        });
    }

    #[test]
    fn test_abort_is_idempotent() {
        let controller = AbortController::new();
        controller.abort();
        controller.abort();
        task::block_on(controller.signal().aborted());
    }
}
