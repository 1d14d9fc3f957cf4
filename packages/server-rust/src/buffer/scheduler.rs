//! Flush Scheduler timer.
//!
//! At most one one-shot timer is armed at a time. A fired timer removes
//! itself with [`FlushTimer::disarm_fired`] before flushing, so cancelling
//! (which only happens on stop) never interrupts a flush already underway.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ArmedTimer {
    id: u64,
    cancel: CancellationToken,
}

/// The buffer's single scheduled-flush slot.
#[derive(Debug, Default)]
pub struct FlushTimer {
    armed: Option<ArmedTimer>,
    next_id: u64,
}

impl FlushTimer {
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Arms a timer that runs `on_fire(id)` after `delay`, unless one is
    /// already armed. Returns `true` if a new timer was armed.
    pub fn arm<F, Fut>(&mut self, runtime: &Handle, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.armed.is_some() {
            return false;
        }
        let id = self.next_id;
        self.next_id += 1;
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => on_fire(id).await,
                () = token.cancelled() => {}
            }
        });

        self.armed = Some(ArmedTimer { id, cancel });
        true
    }

    /// Clears the slot if it still holds timer `id`, without cancelling it.
    /// Called by the timer itself when it fires.
    pub fn disarm_fired(&mut self, id: u64) -> bool {
        if self.armed.as_ref().is_some_and(|t| t.id == id) {
            self.armed = None;
            return true;
        }
        false
    }

    /// Cancels the armed timer, if any. Returns `true` if one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
