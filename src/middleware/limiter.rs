//! Concurrent fixed-window request counters.
//!
//! # Algorithm
//!
//! Every key owns a bucket holding `remaining` admissions and the start of
//! its current window. An admission decrements `remaining`; once it reaches
//! zero further calls are denied until the window rolls over. Rollover is
//! lazy: it happens on the first access after `window` has elapsed, so no
//! timer touches live buckets.
//!
//! # Locking
//!
//! ```text
//! directory: RwLock<HashMap<key, Mutex<Bucket>>>
//!              │ read guard  ─ lookups (shared across keys)
//!              │ write guard ─ insert / evict only
//!              ▼
//!          Mutex<Bucket>     ─ check-then-decrement for one key
//! ```
//!
//! The bucket mutex is only ever taken while a directory guard is held, so
//! the lock order is always directory → bucket. Admissions for different keys
//! share the read guard and never serialize on each other; admissions for
//! the same key serialize on that key's mutex, which makes the
//! check-then-decrement atomic.
//!
//! # Eviction
//!
//! A background sweep runs once per window and deletes buckets whose window
//! started more than two windows ago. Stale keys are collected under the
//! read guard; the write guard is taken only to delete them, and staleness is
//! re-checked under it in case a request touched the bucket in between.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::utils::duration_string;

/// Default requests per window when zero is configured.
pub const DEFAULT_MAX: u32 = 100;

/// Default window length when zero is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Longest accepted window (365 days). Longer windows are capped to it.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Replace a zero `max` or `window` with the defaults and cap `window` at
/// [`MAX_WINDOW`], warning about every correction.
pub(crate) fn normalize_quota(max: u32, window: Duration) -> (u32, Duration) {
    let max = if max == 0 {
        warn!(default = DEFAULT_MAX, "Zero rate limit max configured, using default");
        DEFAULT_MAX
    } else {
        max
    };

    let window = if window.is_zero() {
        warn!(
            default = %duration_string(DEFAULT_WINDOW),
            "Zero rate limit window configured, using default"
        );
        DEFAULT_WINDOW
    } else if window > MAX_WINDOW {
        warn!(
            configured_secs = window.as_secs(),
            max = %duration_string(MAX_WINDOW),
            "Rate limit window too long, capping"
        );
        MAX_WINDOW
    } else {
        window
    };

    (max, window)
}

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Admissions left in the current window after this one.
    pub remaining: u32,
    /// When the current window ends and the bucket refills.
    pub reset_at: Instant,
}

impl Admission {
    /// Time until the bucket refills, floored at zero.
    pub fn retry_after(&self) -> Duration {
        self.reset_at.saturating_duration_since(Instant::now())
    }

    /// [`retry_after`](Self::retry_after) in whole seconds, rounded up so a
    /// client that waits this long finds the bucket refilled.
    pub fn retry_after_secs(&self) -> u64 {
        whole_secs_ceil(self.retry_after())
    }
}

pub(crate) fn whole_secs_ceil(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[derive(Debug)]
struct Bucket {
    remaining: u32,
    window_start: Instant,
}

type Directory = RwLock<HashMap<String, Mutex<Bucket>>>;

#[derive(Debug)]
struct Shared {
    buckets: Directory,
    max: u32,
    window: Duration,
}

impl Shared {
    fn take(&self, bucket: &Mutex<Bucket>) -> Admission {
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if now.saturating_duration_since(bucket.window_start) >= self.window {
            bucket.remaining = self.max;
            bucket.window_start = now;
        }

        let reset_at = bucket.window_start + self.window;

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            Admission {
                allowed: true,
                remaining: bucket.remaining,
                reset_at,
            }
        } else {
            Admission {
                allowed: false,
                remaining: 0,
                reset_at,
            }
        }
    }

    fn is_stale(&self, bucket: &Mutex<Bucket>, now: Instant) -> bool {
        let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(bucket.window_start) > self.window.saturating_mul(2)
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();

        let stale: Vec<String> = {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            buckets
                .iter()
                .filter(|(_, bucket)| self.is_stale(bucket, now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        if stale.is_empty() {
            return 0;
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        for key in stale {
            let still_stale = buckets
                .get(&key)
                .is_some_and(|bucket| self.is_stale(bucket, now));
            if still_stale {
                buckets.remove(&key);
                evicted += 1;
            }
        }
        metrics::set_bucket_count(buckets.len());

        evicted
    }
}

/// Per-key fixed-window limiter shared by all request tasks.
///
/// Cloning is cheap and every clone shares the same buckets and sweep task.
///
/// # Lifecycle
///
/// Construction spawns the eviction sweep on the current tokio runtime. Call
/// [`shutdown`](Self::shutdown) to stop it explicitly; it also ends by itself
/// once every clone of the limiter has been dropped.
#[derive(Clone, Debug)]
pub struct TokenBucketLimiter {
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl TokenBucketLimiter {
    /// Create a limiter admitting `max` requests per key per `window`.
    ///
    /// A zero `max` or `window` falls back to [`DEFAULT_MAX`] or
    /// [`DEFAULT_WINDOW`], and windows beyond [`MAX_WINDOW`] are capped.
    pub fn new(max: u32, window: Duration) -> Self {
        let (max, window) = normalize_quota(max, window);
        let limiter = Self {
            shared: Arc::new(Shared {
                buckets: RwLock::new(HashMap::new()),
                max,
                window,
            }),
            cancellation_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        };

        limiter.spawn_sweep_task();
        limiter
    }

    pub fn max(&self) -> u32 {
        self.shared.max
    }

    pub fn window(&self) -> Duration {
        self.shared.window
    }

    /// Check and consume one admission for `key`.
    pub fn admit(&self, key: &str) -> Admission {
        {
            let buckets = self.shared.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(key) {
                return self.shared.take(bucket);
            }
        }

        // First sighting of this key. Another caller may have inserted it
        // between the two guards, so `entry` keeps whichever bucket won.
        let mut buckets = self.shared.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(key.to_owned()).or_insert_with(|| {
            Mutex::new(Bucket {
                remaining: self.shared.max,
                window_start: Instant::now(),
            })
        });
        let admission = self.shared.take(bucket);
        metrics::set_bucket_count(buckets.len());

        admission
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.shared
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a bucket exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.shared
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Evict idle buckets now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Stop the sweep task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        debug!("Rate limiter sweep task stopped");
    }

    /// Spawn the periodic eviction task.
    ///
    /// The task holds only a `Weak` reference so it never keeps a dropped
    /// limiter's buckets alive.
    fn spawn_sweep_task(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime at limiter construction, idle bucket eviction disabled");
            return;
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = self.shared.window;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(shared) = shared.upgrade() else {
                            debug!("Limiter dropped, sweep task exiting");
                            break;
                        };
                        let evicted = shared.sweep();
                        if evicted > 0 {
                            trace!(evicted, "Evicted idle rate limit buckets");
                        }
                    }
                }
            }
        });
    }
}
