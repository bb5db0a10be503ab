//! Rate-limited work queue
//!
//! Items are deduplicated while queued and never handed to two workers at
//! once: an item added while it is being processed is parked as dirty and
//! requeued exactly once when the worker calls [`WorkQueue::done`]. Failed
//! items come back through [`WorkQueue::add_rate_limited`], delayed by the
//! larger of a per-item exponential backoff and a shared token bucket.

use crate::config::QueueConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Decides how long a failed item waits before it is retried
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again; records a failure
    fn when(&self, item: &K) -> Duration;
    /// Clear the failure history of `item`
    fn forget(&self, item: &K);
    /// Failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item `base * 2^failures`, capped at `max`
pub struct ItemExponentialBackoff<K: Eq + Hash> {
    failures: DashMap<K, u32>,
    base: Duration,
    max: Duration,
}

impl<K: Eq + Hash> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base,
            max,
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ItemExponentialBackoff<K> {
    fn when(&self, item: &K) -> Duration {
        let exp = {
            let mut entry = self.failures.entry(item.clone()).or_insert(0);
            let exp = *entry;
            *entry += 1;
            exp
        };

        let backoff = self.base.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !backoff.is_finite() || backoff > self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &K) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).map(|v| *v).unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all items.
///
/// Every call reserves a token; when the bucket is empty the reservation
/// drives it negative and the returned delay is the time until the
/// reserved token has been refilled.
pub struct BucketRateLimiter {
    bucket: Mutex<Bucket>,
    qps: f64,
    burst: f64,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
            qps,
            burst: burst as f64,
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with the shared bucket
pub fn default_rate_limiter<K>(config: &QueueConfig) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(config.base_delay, config.max_delay)),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}

#[derive(Clone)]
struct QueueMetrics {
    depth: metrics::Gauge,
    adds: metrics::Counter,
    retries: metrics::Counter,
}

impl QueueMetrics {
    fn new() -> Self {
        Self {
            depth: metrics::gauge!("book_operator_workqueue_depth"),
            adds: metrics::counter!("book_operator_workqueue_adds_total"),
            retries: metrics::counter!("book_operator_workqueue_retries_total"),
        }
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Items that need processing, queued or parked behind a worker
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Delayed items and the instant they become ready
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    /// Returns true if the item was newly marked dirty
    fn insert(&mut self, item: K) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.waiting.remove(&item);
        self.dirty.insert(item.clone());
        if !self.processing.contains(&item) {
            self.queue.push_back(item);
        }
        true
    }

    /// Move every waiting item whose deadline passed into the queue
    fn promote_ready(&mut self, now: Instant) {
        let mut ready: Vec<(K, Instant)> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (k.clone(), *at))
            .collect();
        if ready.is_empty() {
            return;
        }
        ready.sort_by_key(|(_, at)| *at);
        for (item, _) in ready {
            self.waiting.remove(&item);
            self.insert(item);
        }
    }
}

/// Deduplicating, rate-limited queue of work items
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    metrics: QueueMetrics,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
            metrics: QueueMetrics::new(),
        }
    }

    /// Queue with [`default_rate_limiter`]
    pub fn with_config(config: &QueueConfig) -> Self {
        Self::new(default_rate_limiter(config))
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || !state.insert(item) {
                return;
            }
            self.metrics.adds.increment(1);
            self.metrics.depth.set(state.queue.len() as f64);
        }
        self.notify.notify_waiters();
    }

    /// Add `item` once `delay` has elapsed. A pending earlier deadline wins.
    pub fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let deadline = Instant::now() + delay;
            state
                .waiting
                .entry(item)
                .and_modify(|at| *at = (*at).min(deadline))
                .or_insert(deadline);
        }
        self.notify.notify_waiters();
    }

    /// Add `item` after the delay chosen by the rate limiter
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.limiter.when(&item);
        self.metrics.retries.increment(1);
        self.add_after(item, delay);
    }

    /// Stop tracking failures of `item`
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next ready item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before inspecting state so a concurrent add is not missed
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_ready(Instant::now());
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.metrics.depth.set(state.queue.len() as f64);
                    return Some(item);
                }
                state.waiting.values().min().copied()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `item`; requeue it if it was added while being processed
    pub fn done(&self, item: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                self.metrics.depth.set(state.queue.len() as f64);
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Number of items ready for processing
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further adds and wake every blocked [`WorkQueue::get`]
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
