//! Command cancellation.
//!
//! A [`CancelHandle`] can be cloned and moved to another task. Cancelling:
//!
//! - before the command has a session makes the execution fail with
//!   [`Error::OperationCancelled`](crate::Error::OperationCancelled) at its
//!   next checkpoint;
//! - while a request is in flight sends an attention signal, and the server
//!   ends the request early.
//!
//! A cancel request only applies to the execution it races with: every
//! execution clears it on entry, so cancelling an idle command has no effect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::transport::Attention;

#[derive(Default)]
struct CancelState {
    requested: AtomicBool,
    attention: Mutex<Option<Arc<dyn Attention>>>,
    notify: Notify,
}

/// Handle for cancelling a command's current execution.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancel the current execution. Idempotent.
    pub fn cancel(&self) {
        self.inner.requested.store(true, Ordering::Release);
        if let Some(attention) = self.inner.attention.lock().as_ref() {
            tracing::debug!("sending attention for cancelled command");
            attention.send_attention();
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was requested since the execution started.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Forget an earlier request; called when an execution starts.
    pub(crate) fn reset(&self) {
        self.inner.requested.store(false, Ordering::Release);
        self.inner.attention.lock().take();
    }

    /// Route later cancels to `attention` until the binding drops.
    pub(crate) fn bind(&self, attention: Arc<dyn Attention>) -> AttentionBinding {
        *self.inner.attention.lock() = Some(attention);
        AttentionBinding {
            handle: self.clone(),
        }
    }

    /// Wait until cancellation is requested.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancel_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("requested", &self.is_cancel_requested())
            .finish()
    }
}

/// Unbinds the attention channel on drop.
pub(crate) struct AttentionBinding {
    handle: CancelHandle,
}

impl Drop for AttentionBinding {
    fn drop(&mut self) {
        self.handle.inner.attention.lock().take();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingAttention(AtomicUsize);

    impl Attention for CountingAttention {
        fn send_attention(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_sends_attention_only_while_bound() {
        let handle = CancelHandle::default();
        let attention = Arc::new(CountingAttention::default());

        let binding = handle.bind(attention.clone());
        handle.cancel();
        assert_eq!(attention.0.load(Ordering::SeqCst), 1);

        drop(binding);
        handle.cancel();
        assert_eq!(attention.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_clears_request() {
        let handle = CancelHandle::default();
        handle.cancel();
        assert!(handle.is_cancel_requested());
        handle.reset();
        assert!(!handle.is_cancel_requested());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let handle = CancelHandle::default();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_when_already_requested() {
        let handle = CancelHandle::default();
        handle.cancel();
        handle.cancelled().await;
    }
}
