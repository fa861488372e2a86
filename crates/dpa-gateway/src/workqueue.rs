//! Deduplicating, rate-limited work queue
//!
//! Keys, not events, are queued. A key added while it is already waiting is
//! dropped; a key added while a worker holds it is parked and queued again
//! when the worker calls [`WorkQueue::done`], so one key is never processed
//! by two workers at once.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::rate_limit::RateLimiter;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys that need processing (queued or parked behind a worker)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    /// Cancels delayed adds on shutdown
    shutdown: CancellationToken,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Requeue `key` after the rate limiter's delay
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        tracing::debug!(key = ?key, delay_ms = delay.as_millis() as u64, "Requeue scheduled");
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Wait for the next key. `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key`; requeues it if it was added while held
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting `get`. Keys already queued
    /// are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ExponentialBackoff;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_processing_is_requeued_on_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        q.add("a".to_string());
        q.add("a".to_string());
        // Parked, not handed out concurrently
        assert_eq!(q.len(), 0);

        q.done(&key);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let q = queue();
        let mut get = task::spawn(q.get());
        assert_pending!(get.poll());

        q.add("a".to_string());
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn shut_down_releases_waiters() {
        let q = queue();
        let mut get = task::spawn(q.get());
        assert_pending!(get.poll());

        q.shut_down();
        assert_ready_eq!(get.poll(), None);

        q.add("late".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = queue();
        q.add_rate_limited("a".to_string());
        q.add_rate_limited("a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 2);

        tokio::time::sleep(Duration::from_millis(4)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        // Both delayed adds (5ms, 10ms) collapse into one pending key
        assert_eq!(q.len(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.len(), 1);

        q.forget(&"a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 0);
    }
}
