//! Cooperative cancellation with an optional deadline.
//!
//! Cancellation is checkpointed: the workflow engine checks the handle before
//! each step and the scheduler before each job. Work already in flight is
//! never interrupted; only retry back-off sleeps wake early. A
//! [`PauseGate`] holds an execution at the same checkpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A [`CancellationToken`] plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that reports itself cancelled once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A handle that fires with this one, keeping its deadline, but whose own
    /// [`cancel`](Self::cancel) does not reach the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_exceeded()
    }

    /// Human-readable reason, if the handle has fired.
    pub fn reason(&self) -> Option<&'static str> {
        if self.token.is_cancelled() {
            Some("cancelled by request")
        } else if self.deadline_exceeded() {
            Some("deadline exceeded")
        } else {
            None
        }
    }

    /// Resolves once the handle is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleeps for `delay` unless cancelled first. Returns `false` when cancelled.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}

/// Holds a workflow between steps while paused.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { paused: Arc::new(tx) }
    }

    /// Returns `false` if the gate was already paused.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns `false` if the gate was not paused.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Waits until resumed. Returns `false` if `cancel` fired first.
    pub async fn wait_resumed(&self, cancel: &CancelHandle) -> bool {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            resumed = rx.wait_for(|paused| !*paused) => resumed.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_is_not_cancelled() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        assert!(handle.reason().is_none());
    }

    #[test]
    fn clones_share_the_flag() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), Some("cancelled by request"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_after_timeout() {
        let handle = CancelHandle::with_timeout(Duration::from_secs(10));
        assert!(!handle.is_cancelled());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), Some("deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_interrupted_by_cancel() {
        let handle = CancelHandle::new();
        let canceller = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let completed = handle.sleep(Duration::from_secs(60)).await;
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let handle = CancelHandle::new();
        assert!(handle.sleep(Duration::from_millis(50)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelHandle::with_timeout(Duration::from_secs(5));
        let child = parent.child();
        assert_eq!(child.deadline(), parent.deadline());

        let sibling = parent.child();
        sibling.cancel();
        assert!(sibling.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());

        parent.cancel();
        child.cancelled().await;
        assert_eq!(child.reason(), Some("cancelled by request"));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_gate_waits_for_resume() {
        let gate = PauseGate::new();
        assert!(gate.pause());
        assert!(!gate.pause());

        let resumer = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            resumer.resume();
        });
        let start = Instant::now();
        assert!(gate.wait_resumed(&CancelHandle::new()).await);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(!gate.is_paused());
        assert!(!gate.resume());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_a_paused_gate() {
        let gate = PauseGate::new();
        gate.pause();
        let cancel = CancelHandle::with_timeout(Duration::from_secs(1));
        assert!(!gate.wait_resumed(&cancel).await);
        assert!(gate.is_paused());
    }
}
