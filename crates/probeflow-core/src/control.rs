//! Out-of-band execution control: pause, resume, stop.
//!
//! Pause/resume is a single-slot rendezvous on a `watch` channel: the
//! orchestrator parks on [`ExecutionControl::wait_until_resumed`] and the
//! host signals it from any task. Stop is a `CancellationToken` composed
//! into every wait, so a stopped execution unblocks within one cooperative
//! yield.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cloneable handle for pausing, resuming, and stopping an execution.
///
/// All operations are idempotent. `pause()` takes effect at the next step
/// boundary; `stop()` wins over everything and is permanent.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                paused,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Request a pause. Only observable while the execution is running.
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    /// Clear the pause and wake the parked orchestrator, if any.
    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Cancel the execution. Unblocks manual pauses and pending delays.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Park until the host resumes. Returns false when stopped instead.
    pub(crate) async fn wait_until_resumed(&self) -> bool {
        let mut rx = self.inner.paused.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            result = rx.wait_for(|paused| !*paused) => result.is_ok(),
        }
    }

    /// Sleep for `duration`, returning false early when stopped.
    pub(crate) async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
