//! Deduplicating, rate-limited work queue
//!
//! Items are coalesced while pending: adding an item that is already queued
//! is a no-op, and adding an item that is currently being processed marks it
//! dirty so it is queued again once the worker calls [`WorkQueue::done`].
//! A given item is therefore never handed to two workers at the same time.
//!
//! Delayed items sit in a min-heap keyed by their ready time and are moved
//! into the queue by whichever worker next calls [`WorkQueue::get`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Decides how long an item waits before it is retried
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before the next retry of `item`; each call counts as a failure
    fn when(&self, item: &T) -> Duration;
    /// Reset failure tracking for `item`
    fn forget(&self, item: &T);
    /// Number of failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: Eq + Hash> ExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RateLimiter<T> for ExponentialBackoff<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let delay = self.base.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !delay.is_finite() || delay >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(delay)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // Reserve a token even when the bucket is empty; the deficit is the wait
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Uses the longest delay of all wrapped limiters
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item backoff from 5ms up to 1000s, bounded overall to 10 qps with a
/// burst of 100.
pub fn default_controller_rate_limiter<T>() -> MaxOf<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOf::new(vec![
        Box::new(ExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(TokenBucket::new(10.0, 100)),
    ])
}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing, queued or not
    dirty: HashSet<T>,
    /// Items handed out by `get` and not yet `done`
    processing: HashSet<T>,
    waiting: BinaryHeap<Reverse<Waiting<T>>>,
    /// Live heap entry per item; older entries are skipped when popped
    waiting_index: HashMap<T, (Instant, u64)>,
    next_seq: u64,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> State<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            waiting_index: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the item was pushed onto the queue
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_ready(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.waiting.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.waiting.pop() else {
                break;
            };
            if self.waiting_index.get(&entry.item) == Some(&(entry.ready_at, entry.seq)) {
                self.waiting_index.remove(&entry.item);
                self.insert(entry.item);
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse(head)| head.ready_at)
    }
}

/// Work queue with deduplication, in-flight tracking and delayed re-adds
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(rate_limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    /// Queue using [`default_controller_rate_limiter`]
    pub fn with_default_rate_limiter() -> Self {
        Self::new(Box::new(default_controller_rate_limiter()))
    }

    /// Mark `item` as needing processing. Ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut state = lock(&self.state);
        if state.shutting_down {
            return;
        }
        if state.insert(item) {
            self.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// If the item is already waiting with an earlier ready time, the
    /// earlier time is kept.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let mut state = lock(&self.state);
        if state.shutting_down {
            return;
        }
        let ready_at = Instant::now() + delay;
        if let Some((existing, _)) = state.waiting_index.get(&item) {
            if *existing <= ready_at {
                return;
            }
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.waiting_index.insert(item.clone(), (ready_at, seq));
        state.waiting.push(Reverse(Waiting {
            ready_at,
            seq,
            item,
        }));
        drop(state);

        // Sleeping workers recompute their deadline
        self.notify.notify_waiters();
    }

    /// Add `item` after the delay the rate limiter assigns to it
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the rate limiter's failure history for `item`
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item and mark it as processing.
    ///
    /// Returns `None` once the queue has been shut down. Every item returned
    /// must be passed back to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = lock(&self.state);
                if state.shutting_down {
                    return None;
                }
                state.promote_ready(Instant::now());
                match state.queue.pop_front() {
                    Some(item) => {
                        state.dirty.remove(&item);
                        state.processing.insert(item.clone());
                        if !state.queue.is_empty() {
                            self.notify.notify_one();
                        }
                        return Some(item);
                    }
                    None => state.next_ready_at(),
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark processing of `item` finished, re-queueing it if it was added
    /// again in the meantime.
    pub fn done(&self, item: &T) {
        let mut state = lock(&self.state);
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.notify.notify_one();
        }
    }

    /// Stop handing out items and wake every blocked `get`. Idempotent.
    pub fn shut_down(&self) {
        lock(&self.state).shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.state).shutting_down
    }

    /// Number of items ready to be handed out
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready_eq};

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(Box::new(ExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        ))))
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let q = queue();
        q.add("node-a".to_string());
        q.add("node-a".to_string());
        assert_eq!(q.len(), 1);

        let item = q.get().await.unwrap();
        assert_eq!(item, "node-a");
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_after_done() {
        let q = queue();
        q.add("node-a".to_string());
        let item = q.get().await.unwrap();

        q.add("node-a".to_string());
        assert_eq!(q.len(), 0, "in-flight item must not be handed out twice");

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.unwrap(), "node-a");
    }

    #[tokio::test]
    async fn test_done_without_re_add_does_not_requeue() {
        let q = queue();
        q.add("node-a".to_string());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_across_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.add("a".to_string());
        assert_eq!(q.get().await.unwrap(), "a");
        assert_eq!(q.get().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_waiting_get() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shut_down();
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_ignored() {
        let q = queue();
        q.shut_down();
        q.add("node-a".to_string());
        q.add_after("node-b".to_string(), Duration::from_millis(10));
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_get_wakes_on_add() {
        let q = queue();
        let mut get = tokio_test::task::spawn(q.get());
        assert_pending!(get.poll());

        q.add("node-a".to_string());
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), Some("node-a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_item() {
        let q = queue();
        let start = Instant::now();
        q.add_after("node-a".to_string(), Duration::from_secs(2));
        assert!(q.is_empty());

        assert_eq!(q.get().await.unwrap(), "node-a");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_ready_time() {
        let q = queue();
        let start = Instant::now();
        q.add_after("node-a".to_string(), Duration::from_secs(10));
        q.add_after("node-a".to_string(), Duration::from_secs(1));
        q.add_after("node-a".to_string(), Duration::from_secs(5));

        let item = q.get().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        q.done(&item);

        tokio::time::advance(Duration::from_secs(20)).await;
        let next = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert!(next.is_err(), "stale heap entry must not requeue the item");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_get_picks_up_earlier_delayed_item() {
        let q = queue();
        q.add_after("late".to_string(), Duration::from_secs(60));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.add_after("early".to_string(), Duration::from_secs(1));
        assert_eq!(waiter.await.unwrap().as_deref(), Some("early"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off() {
        let q = queue();
        let key = "node-a".to_string();

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        assert_eq!(q.get().await.unwrap(), key);
    }

    #[test]
    fn test_exponential_backoff_is_monotonic_and_capped() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "node-a".to_string();

        let delays: Vec<Duration> = (0..12).map(|_| limiter.when(&key)).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_forget_resets() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "node-a".to_string();
        limiter.when(&key);
        limiter.when(&key);
        limiter.forget(&key);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_backoff_tracks_items_independently() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        limiter.when(&"a".to_string());
        limiter.when(&"a".to_string());
        assert_eq!(limiter.when(&"b".to_string()), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_backoff_survives_huge_failure_counts() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = 1u32;
        for _ in 0..2000 {
            limiter.when(&key);
        }
        assert_eq!(limiter.when(&key), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_allows_burst_then_waits() {
        let bucket = TokenBucket::new(1.0, 2);
        assert_eq!(RateLimiter::<u32>::when(&bucket, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u32>::when(&bucket, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u32>::when(&bucket, &0), Duration::from_secs(1));
    }

    #[test]
    fn test_max_of_uses_longest_delay() {
        let limiter: MaxOf<u32> = MaxOf::new(vec![
            Box::new(ExponentialBackoff::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            )),
            Box::new(ExponentialBackoff::new(
                Duration::from_millis(50),
                Duration::from_secs(1),
            )),
        ]);
        assert_eq!(limiter.when(&7), Duration::from_millis(50));
        assert_eq!(limiter.num_requeues(&7), 1);
        limiter.forget(&7);
        assert_eq!(limiter.num_requeues(&7), 0);
    }
}
