//! Named per-automation timers with replace semantics

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::actor::ActorMessage;

/// The timer table of one automation
///
/// Maps user-chosen names to armed timer handles. Arming a name that is
/// already armed cancels the old handle first, so at most one timer
/// exists per name. Shared between the actor loop and its context; the
/// actor serializes callbacks, so the lock is uncontended.
#[derive(Clone, Default)]
pub struct TimerTable {
    inner: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl TimerTable {
    /// Arm (or replace) a named timer
    ///
    /// After `delay_ms` the timer delivers [`ActorMessage::TimerFired`]
    /// to the mailbox. The old handle is cancelled before the new one is
    /// stored so the table never points at a stale timer.
    pub fn arm(&self, name: &str, delay_ms: u64, mailbox: mpsc::Sender<ActorMessage>) {
        let mut timers = self.lock();
        if let Some(old) = timers.remove(name) {
            debug!(timer = name, "replacing armed timer");
            old.abort();
        }

        let fired_name = name.to_string();
        let task = tokio::spawn(async move {
            sleep(Duration::from_millis(delay_ms)).await;
            let _ = mailbox.send(ActorMessage::TimerFired(fired_name)).await;
        });
        timers.insert(name.to_string(), task.abort_handle());
    }

    /// Cancel a named timer; cancelling an unknown name is a no-op
    pub fn cancel(&self, name: &str) {
        if let Some(handle) = self.lock().remove(name) {
            handle.abort();
        }
    }

    /// Remove a fired timer from the table, before its callback runs
    pub fn take(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Cancel every armed timer
    pub fn clear(&self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no timer is armed
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout, Instant};

    // Scheduling :off at 300s, then a second later at 60s, fires exactly
    // once, ~60s after the second call.
    #[tokio::test(start_paused = true)]
    async fn test_replace_fires_once_at_new_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let timers = TimerTable::default();
        let start = Instant::now();

        timers.arm("off", 300_000, tx.clone());
        advance(Duration::from_secs(1)).await;
        timers.arm("off", 60_000, tx.clone());
        assert_eq!(timers.len(), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, ActorMessage::TimerFired("off".to_string()));
        assert_eq!(start.elapsed(), Duration::from_secs(61));

        // The original 300s timer never fires
        assert!(timeout(Duration::from_secs(400), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(8);
        let timers = TimerTable::default();

        timers.arm("bedtime", 10_000, tx.clone());
        timers.cancel("bedtime");
        timers.cancel("bedtime");
        timers.cancel("never_armed");

        assert!(timers.is_empty());
        assert!(timeout(Duration::from_secs(60), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_names_both_fire() {
        let (tx, mut rx) = mpsc::channel(8);
        let timers = TimerTable::default();

        timers.arm("first", 1_000, tx.clone());
        timers.arm("second", 2_000, tx.clone());

        assert_eq!(
            rx.recv().await.unwrap(),
            ActorMessage::TimerFired("first".to_string())
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ActorMessage::TimerFired("second".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_removes_entry() {
        let (tx, _rx) = mpsc::channel(8);
        let timers = TimerTable::default();

        timers.arm("off", 1_000, tx);
        assert!(timers.take("off"));
        assert!(!timers.take("off"));
        assert!(timers.is_empty());
    }
}
