//! Deduplicating work queue with rate-limited requeue
//!
//! A key is held at most once in the queue and handed to at most one worker
//! at a time. Keys added while being processed are queued again once the
//! worker calls [`WorkQueue::done`].

use reconciling::FibonacciBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default minimum requeue delay
pub const DEFAULT_MIN_REQUEUE: Duration = Duration::from_millis(5);
/// Default maximum requeue delay
pub const DEFAULT_MAX_REQUEUE: Duration = Duration::from_secs(300);

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    token: CancellationToken,
    min_requeue: Duration,
    max_requeue: Duration,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("min_requeue", &self.inner.min_requeue)
            .field("max_requeue", &self.inner.max_requeue)
            .finish_non_exhaustive()
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Queue with the default requeue backoff
    #[must_use]
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_MIN_REQUEUE, DEFAULT_MAX_REQUEUE)
    }

    /// Queue whose rate-limited requeues back off between `min` and `max`
    #[must_use]
    pub fn with_backoff(min: Duration, max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                token: CancellationToken::new(),
                min_requeue: min,
                max_requeue: max,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` unless it is already queued
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed; requeues it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` after `delay`, unless the queue shuts down first
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Requeue `item` with a delay that grows with its failure count
    pub fn add_rate_limited(&self, item: T) {
        let count = {
            let mut state = self.state();
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = FibonacciBackoff::calculate_for_error_count(count, self.inner.min_requeue, self.inner.max_requeue);
        self.add_after(item, delay);
    }

    /// Reset the failure count of `item`
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// Number of rate-limited requeues of `item` since the last forget
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.token.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) was called
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether nothing is queued or being processed
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.queue.is_empty() && state.processing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_after_done() {
        let queue = WorkQueue::new();
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        assert!(queue.is_empty(), "in-flight key must not be handed out twice");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
        queue.add("late");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_grows_and_forgets() {
        let queue = WorkQueue::with_backoff(Duration::from_millis(10), Duration::from_secs(1));
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);

        assert_eq!(queue.get().await, Some("a"));
        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_worker_per_key() {
        let queue = WorkQueue::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let in_flight = Arc::clone(&in_flight);
            let processed = Arc::clone(&processed);
            workers.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            }));
        }

        for _ in 0..50 {
            queue.add("project-a");
            tokio::task::yield_now().await;
        }
        while !queue.is_idle() {
            tokio::task::yield_now().await;
        }
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }

        assert!(processed.load(Ordering::SeqCst) >= 1);
    }
}
