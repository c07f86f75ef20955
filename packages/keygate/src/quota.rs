//! Fixed-window quota accounting.
//!
//! Every quota check is keyed by a `(scope, identity)` pair. The counter for
//! a pair lives in a [`CounterStore`], which is the only mutable state shared
//! between request handlers; the store applies each check-and-increment
//! atomically for its key, so two concurrent callers can never both take the
//! last slot in a window.
//!
//! ## Window semantics
//!
//! Windows are fixed, not sliding: a counter's window starts at the first
//! request seen for its key and lasts for the rule's window length. A burst
//! straddling the rollover can therefore admit up to twice the ceiling in a
//! short span.
//!
//! Rejected checks do not consume a slot, but admitted checks are never
//! returned: if the request is later cancelled, its increment stays.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use color_eyre::Result;
use dashmap::DashMap;
use derive_more::Debug;
use futures::future::{self, BoxFuture, FutureExt};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::policy::QuotaRule;

/// A source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// The system wall clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the quota tracker and advance another.
#[derive(Clone, Debug)]
#[debug("ManualClock({:?})", self.now())]
pub struct ManualClock(Arc<Mutex<OffsetDateTime>>);

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Set the clock to an exact time.
    pub fn set(&self, to: OffsetDateTime) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identifies a single quota counter.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct CounterKey {
    pub scope: String,
    pub identity: String,
}

impl CounterKey {
    pub fn new(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.identity)
    }
}

/// The outcome of a single quota check.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Decision {
    /// The request fits in the current window.
    Admit {
        /// Slots left in the window after this request.
        remaining: u64,

        /// Seconds until the window resets.
        reset_after: u64,
    },

    /// The window is full.
    Reject {
        /// Seconds until the window resets; never more than the window length.
        retry_after: u64,
    },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }
}

/// Request count for one key within its current window.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Counter {
    pub count: u64,
    pub window_start: OffsetDateTime,
    pub window: Duration,
}

impl Counter {
    pub fn new(now: OffsetDateTime, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
        }
    }

    /// When the current window ends.
    pub fn expires_at(&self) -> OffsetDateTime {
        self.window_start + self.window
    }

    /// Apply one fixed-window step: reset an expired window, then admit and
    /// count the request if a slot is free.
    ///
    /// Callers must hold exclusive access to the counter for the duration of
    /// the call; that is what makes the check and the increment atomic.
    pub fn check_and_increment(
        &mut self,
        ceiling: u64,
        window: Duration,
        now: OffsetDateTime,
    ) -> Decision {
        self.window = window;
        if now >= self.expires_at() {
            self.count = 0;
            self.window_start = now;
        }

        let reset_after = self.seconds_until_reset(now);
        if self.count >= ceiling {
            return Decision::Reject {
                retry_after: reset_after,
            };
        }

        self.count += 1;
        Decision::Admit {
            remaining: ceiling - self.count,
            reset_after,
        }
    }

    fn seconds_until_reset(&self, now: OffsetDateTime) -> u64 {
        let left = (self.expires_at() - now).as_seconds_f64().max(0.0).ceil() as u64;
        left.min(self.window.as_secs())
    }
}

/// Shared storage for quota counters.
///
/// Implementations must make [`CounterStore::check_and_increment`] atomic
/// per key. A networked store would typically do this with a server-side
/// script or a compare-and-swap loop; the in-memory store holds the map
/// shard lock for the key while it runs [`Counter::check_and_increment`].
pub trait CounterStore: Send + Sync + 'static {
    /// Check the counter for `key`, counting the request if it is admitted.
    /// Creates the counter on first use.
    fn check_and_increment(
        &self,
        key: CounterKey,
        ceiling: u64,
        window: Duration,
        now: OffsetDateTime,
    ) -> BoxFuture<'_, Result<Decision>>;

    /// Remove counters whose window ended at or before `now`.
    /// Returns the number of counters removed.
    fn sweep(&self, now: OffsetDateTime) -> BoxFuture<'_, Result<usize>>;
}

/// Process-local counter store.
#[derive(Clone, Debug, Default)]
#[debug("MemoryCounters(len = {})", self.counters.len())]
pub struct MemoryCounters {
    counters: Arc<DashMap<CounterKey, Counter>>,
}

impl MemoryCounters {
    /// Read a counter without modifying it.
    pub fn get(&self, key: &CounterKey) -> Option<Counter> {
        self.counters.get(key).map(|counter| *counter)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl CounterStore for MemoryCounters {
    fn check_and_increment(
        &self,
        key: CounterKey,
        ceiling: u64,
        window: Duration,
        now: OffsetDateTime,
    ) -> BoxFuture<'_, Result<Decision>> {
        let decision = self
            .counters
            .entry(key)
            .or_insert_with(|| Counter::new(now, window))
            .check_and_increment(ceiling, window, now);
        future::ready(Ok(decision)).boxed()
    }

    fn sweep(&self, now: OffsetDateTime) -> BoxFuture<'_, Result<usize>> {
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at() > now);
        let removed = before.saturating_sub(self.counters.len());
        future::ready(Ok(removed)).boxed()
    }
}

/// Applies quota rules against a counter store using an injected clock.
#[derive(Clone, Debug)]
#[debug("QuotaTracker(..)")]
pub struct QuotaTracker {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(store: impl CounterStore, clock: impl Clock) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(clock),
        }
    }

    /// Count one request for `identity_key` in `scope` against `rule`.
    ///
    /// Errors only when the counter store is unreachable; callers decide
    /// whether that admits or rejects the request.
    #[tracing::instrument(name = "QuotaTracker::check_and_increment", skip(self, rule), fields(ceiling = rule.ceiling))]
    pub async fn check_and_increment(
        &self,
        scope: &str,
        identity_key: &str,
        rule: &QuotaRule,
    ) -> Result<Decision> {
        let now = self.clock.now();
        let key = CounterKey::new(scope, identity_key);
        let decision = self
            .store
            .check_and_increment(key, rule.ceiling, rule.window, now)
            .await?;
        trace!(?decision, "quota.check");
        Ok(decision)
    }

    /// Drop counters for windows that have already ended.
    #[tracing::instrument(name = "QuotaTracker::sweep", skip(self))]
    pub async fn sweep(&self) -> Result<usize> {
        let removed = self.store.sweep(self.clock.now()).await?;
        debug!(removed, "quota.sweep");
        Ok(removed)
    }
}
