//! Cancellation signal shared by a reconciliation pass and its pollers.

use tokio::sync::watch;

/// Sending half. Cancels every [`Cancellation`] cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }
}

/// Receiving half, cheap to clone into every concurrent unit.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/cancellation pair.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle was dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        let closed = self.rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_every_clone() {
        let (handle, cancel) = cancellation();
        let mut a = cancel.clone();
        let mut b = cancel;

        let waiter = tokio::spawn(async move { a.cancelled().await });
        handle.cancel();
        waiter.await.unwrap();
        b.cancelled().await;
        assert!(b.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_fire() {
        let mut cancel = Cancellation::never();
        let fired = tokio::time::timeout(Duration::from_secs(60), cancel.cancelled()).await;
        assert!(fired.is_err());
        assert!(!cancel.is_cancelled());
    }
}
