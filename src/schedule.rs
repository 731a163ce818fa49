//! Cancellable one-shot scheduled tasks.
//!
//! Used for the queue flush timer and the correlator debounce. Arming always
//! cancels whatever was previously armed, so at most one task per purpose is
//! ever pending.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single pending delayed action owned by the component that armed it.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    token: Option<CancellationToken>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay` unless cancelled or re-armed first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => {}
                () = tokio::time::sleep(delay) => action.await,
            }
        });
        self.token = Some(token);
    }

    /// Cancel the pending action, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    /// Whether an action is pending (armed and not yet cancelled or taken).
    pub fn is_armed(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
