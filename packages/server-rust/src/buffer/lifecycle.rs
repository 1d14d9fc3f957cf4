//! Lifecycle controller for the write buffer.
//!
//! Uses `ArcSwap` for lock-free state reads on the enqueue path and a `watch`
//! channel so shutdown hooks can await a transition.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Buffer lifecycle state.
///
/// State machine: Running -> Stopping -> Stopped. Transitions only move
/// forward; a stopped buffer is never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting patches and scheduling flushes.
    Running,
    /// Draining: patches are still accepted, no timer is armed.
    Stopping,
    /// Drained. Enqueues and flushes are no-ops.
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Owns the lifecycle state and notifies listeners of transitions.
#[derive(Debug)]
pub struct LifecycleController {
    state: ArcSwap<LifecycleState>,
    transitions: watch::Sender<LifecycleState>,
}

impl LifecycleController {
    /// Creates a controller in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Running);
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Running),
            transitions: tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Returns a receiver notified on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.transitions.subscribe()
    }

    /// Moves `Running -> Stopping`.
    ///
    /// Returns `true` only for the caller that performed the transition;
    /// concurrent or repeated calls get `false`.
    pub fn begin_stop(&self) -> bool {
        self.transition(LifecycleState::Running, LifecycleState::Stopping)
    }

    /// Moves `Stopping -> Stopped`.
    pub fn finish_stop(&self) -> bool {
        self.transition(LifecycleState::Stopping, LifecycleState::Stopped)
    }

    /// Waits until the controller reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|s| *s == LifecycleState::Stopped).await;
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let current = self.state.load_full();
        if *current != from {
            return false;
        }
        let previous = self.state.compare_and_swap(&current, Arc::new(to));
        if !Arc::ptr_eq(&*previous, &current) {
            return false;
        }
        self.transitions.send_replace(to);
        true
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn initial_state_is_running() {
        let controller = LifecycleController::new();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert!(controller.is_running());
    }

    #[test]
    fn transitions_move_forward_only() {
        let controller = LifecycleController::new();

        assert!(!controller.finish_stop());
        assert!(controller.begin_stop());
        assert_eq!(controller.state(), LifecycleState::Stopping);
        assert!(!controller.begin_stop());

        assert!(controller.finish_stop());
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(!controller.begin_stop());
        assert!(!controller.finish_stop());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let controller = LifecycleController::new();
        let mut rx = controller.subscribe();
        assert_eq!(*rx.borrow(), LifecycleState::Running);

        controller.begin_stop();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Stopping);
    }

    #[tokio::test]
    async fn wait_stopped_resolves_after_finish() {
        let controller = Arc::new(LifecycleController::new());
        controller.begin_stop();

        let waiter = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.wait_stopped().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        controller.finish_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn state_names() {
        assert_eq!(LifecycleState::Running.as_str(), "running");
        assert_eq!(LifecycleState::Stopping.as_str(), "stopping");
        assert_eq!(LifecycleState::Stopped.as_str(), "stopped");
    }
}
