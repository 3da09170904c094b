//! Per-call timeout manager.
//!
//! One timer per outstanding call id. A timer that fires removes its own
//! bookkeeping entry before notifying, and [`TimeoutManager::clear`] removes
//! the entry before aborting, so firing and clearing are mutually exclusive:
//! whichever removes the entry first is the single winner.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

// Bound on the timed-out record set; beyond this, very late responses are
// indistinguishable from unknown ids, which only affects a log line.
const MAX_FIRED_RECORDS: usize = 1024;

/// Tracks one cancellable deadline per outstanding call id.
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: Mutex<HashMap<u64, JoinHandle<()>>>,
    fired: Mutex<HashSet<u64>>,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                fired: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Arm a timeout for `call_id`. If it elapses before [`clear`] wins,
    /// `on_timeout` is invoked exactly once with the call id.
    ///
    /// [`clear`]: TimeoutManager::clear
    pub fn set<F>(&self, call_id: u64, duration: Duration, on_timeout: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        // Hold the entries lock across the spawn so a zero-duration timer
        // cannot fire before its own handle is inserted.
        let mut entries = self.inner.entries.lock().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Removal decides the race against clear(); only the winner
            // delivers the notification.
            if inner.entries.lock().unwrap().remove(&call_id).is_none() {
                return;
            }
            {
                let mut fired = inner.fired.lock().unwrap();
                if fired.len() >= MAX_FIRED_RECORDS {
                    fired.clear();
                }
                fired.insert(call_id);
            }
            tracing::debug!("call {} timed out after {:?}", call_id, duration);
            on_timeout(call_id);
        });
        let previous = entries.insert(call_id, handle);
        debug_assert!(previous.is_none(), "timeout already armed for {call_id}");
    }

    /// Disarm the timeout for `call_id`. Returns whether this call won the
    /// race (the entry was still present). Idempotent.
    pub fn clear(&self, call_id: u64) -> bool {
        match self.inner.entries.lock().unwrap().remove(&call_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Disarm every outstanding timeout and drop all timed-out records.
    pub fn clear_all(&self) {
        let entries: Vec<_> = {
            let mut map = self.inner.entries.lock().unwrap();
            map.drain().collect()
        };
        for (_, handle) in entries {
            handle.abort();
        }
        self.inner.fired.lock().unwrap().clear();
    }

    /// Whether a timeout is still armed for `call_id`.
    pub fn is_tracked(&self, call_id: u64) -> bool {
        self.inner.entries.lock().unwrap().contains_key(&call_id)
    }

    /// Whether `call_id` timed out and has not been acknowledged yet.
    pub fn is_timed_out(&self, call_id: u64) -> bool {
        self.inner.fired.lock().unwrap().contains(&call_id)
    }

    /// Retire the timed-out record for `call_id` after consuming it.
    pub fn acknowledge(&self, call_id: u64) {
        self.inner.fired.lock().unwrap().remove(&call_id);
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn firing_self_clears_and_notifies_once() {
        let timeouts = TimeoutManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        timeouts.set(1, Duration::from_millis(10), move |id| {
            tx.send(id).unwrap();
        });
        assert!(timeouts.is_tracked(1));

        assert_eq!(rx.recv().await, Some(1));
        assert!(!timeouts.is_tracked(1));
        assert!(timeouts.is_timed_out(1));
        // The entry already self-cleared; a late clear loses the race.
        assert!(!timeouts.clear(1));

        timeouts.acknowledge(1);
        assert!(!timeouts.is_timed_out(1));
    }

    #[tokio::test]
    async fn clearing_prevents_the_notification() {
        let timeouts = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timeouts.set(7, Duration::from_millis(20), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timeouts.clear(7));
        assert!(!timeouts.clear(7));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timeouts.is_timed_out(7));
    }

    #[tokio::test]
    async fn clear_all_disarms_everything() {
        let timeouts = TimeoutManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for id in 1..=5 {
            let counter = Arc::clone(&fired);
            timeouts.set(id, Duration::from_millis(20), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        timeouts.clear_all();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        for id in 1..=5 {
            assert!(!timeouts.is_tracked(id));
        }
    }
}
