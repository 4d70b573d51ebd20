//! Bucket rate limiter
//!
//! Tracks per-bucket and global cooldowns observed from API responses and
//! suspends callers until the next request is safe to issue. The gateway
//! send path reuses the same primitive through a fixed-window bucket.
//!
//! The first caller to observe an exhausted bucket starts that bucket's
//! cooldown timer; every concurrent caller waits on the bucket's shared
//! cooled-down signal and resumes at the same instant. The timer runs as
//! its own task, so a caller cancelled mid-wait can never leave the bucket
//! wedged in its cooling-down state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Safety margin added on top of the server-reported reset deadline.
const RESET_MARGIN: Duration = Duration::from_millis(500);

/// Identifies the unit of rate-limit accounting.
///
/// REST buckets are keyed by method plus the route template with only the
/// major parameters filled in, so distinct URLs sharing a template share
/// one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    /// Process-wide bucket substituted whenever a response signals a global limit
    Global,
    /// Fixed bucket for outbound gateway payloads
    Gateway,
    /// REST bucket: method plus major-parameter route
    Route { method: String, path: String },
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Gateway => write!(f, "gateway"),
            Self::Route { method, path } => write!(f, "{method} {path}"),
        }
    }
}

/// Rate-limit view extracted from a single API response.
///
/// The headers are all-or-nothing: when the remaining-count header is
/// absent the response carried no rate-limit information and the bucket
/// must be left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    /// Requests left before the bucket exhausts
    pub remaining: Option<u32>,
    /// Deadline at which the bucket resets
    pub reset: Option<DateTime<Utc>>,
    /// Server clock at response time, used to compute the cooldown span
    pub date: Option<DateTime<Utc>>,
    /// Whether the response signalled a global limit
    pub global: bool,
}

impl RateLimitInfo {
    /// Extract rate-limit headers from an API response.
    #[must_use]
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        Self {
            remaining: header_str("X-RateLimit-Remaining").and_then(|v| v.parse().ok()),
            reset: header_str("X-RateLimit-Reset")
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            date: header_str("Date")
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            global: headers.contains_key("X-RateLimit-Global"),
        }
    }
}

/// How a bucket's quota is determined.
#[derive(Debug, Clone, Copy)]
enum Quota {
    /// Updated from observed response headers
    HeaderDriven,
    /// N requests per fixed window, known up front (gateway send path)
    FixedWindow { limit: u32, window: Duration },
}

#[derive(Debug, Default)]
struct BucketState {
    remaining: u32,
    reset: Option<DateTime<Utc>>,
    date: Option<DateTime<Utc>>,
    cooling_down: bool,
    // fixed-window bookkeeping
    window_started: Option<Instant>,
    used: u32,
}

/// What an acquire decided to do, resolved under the state lock.
enum Action {
    Pass,
    Wait(watch::Receiver<bool>),
    Cooldown(Duration),
}

/// A single bucket with cooldown tracking.
///
/// Exactly one cooldown timer is in flight per bucket at any time; all
/// other callers observe the shared cooled-down signal.
struct CooldownBucket {
    key: BucketKey,
    quota: Quota,
    state: Mutex<BucketState>,
    /// `true` while the bucket is safe; flipped to `false` for the duration
    /// of a cooldown so waiters can await the transition back.
    cooled_down: watch::Sender<bool>,
}

impl CooldownBucket {
    fn new(key: BucketKey, quota: Quota) -> Self {
        Self {
            key,
            quota,
            state: Mutex::new(BucketState::default()),
            cooled_down: watch::Sender::new(true),
        }
    }

    /// Whether the next request would exhaust the limit.
    fn will_rate_limit(state: &BucketState) -> bool {
        state.remaining == 0
            && state
                .reset
                .is_some_and(|reset| Utc::now() <= reset)
    }

    /// Cooldown span: reset deadline minus the server's response clock,
    /// plus a small safety margin.
    fn cooldown_delay(state: &BucketState) -> Duration {
        let reference = state.date.unwrap_or_else(Utc::now);
        let span = state
            .reset
            .map(|reset| reset - reference)
            .and_then(|span| span.to_std().ok())
            .unwrap_or_default();
        span + RESET_MARGIN
    }

    fn decide(&self) -> Action {
        let mut state = self.state.lock();

        if let Quota::FixedWindow { limit, window } = self.quota {
            // Refill on window rollover
            let now = Instant::now();
            let rolled = state
                .window_started
                .is_none_or(|started| now.duration_since(started) >= window);
            if rolled && !state.cooling_down {
                state.window_started = Some(now);
                state.used = 0;
            }

            if state.cooling_down {
                return Action::Wait(self.cooled_down.subscribe());
            }
            if state.used < limit {
                state.used += 1;
                return Action::Pass;
            }
            state.cooling_down = true;
            self.cooled_down.send_replace(false);
            let elapsed = state
                .window_started
                .map(|started| now.duration_since(started))
                .unwrap_or_default();
            return Action::Cooldown(window.saturating_sub(elapsed));
        }

        if state.cooling_down {
            Action::Wait(self.cooled_down.subscribe())
        } else if Self::will_rate_limit(&state) {
            state.cooling_down = true;
            self.cooled_down.send_replace(false);
            Action::Cooldown(Self::cooldown_delay(&state))
        } else {
            Action::Pass
        }
    }

    /// Suspend until the bucket is safe, returning the time spent waiting.
    async fn acquire(self: &Arc<Self>) -> Duration {
        let mut cooled = match self.decide() {
            Action::Pass => return Duration::ZERO,
            Action::Wait(cooled) => cooled,
            Action::Cooldown(delay) => {
                tracing::debug!(
                    bucket = %self.key,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Cooling down bucket"
                );
                // The timer must outlive this caller: a cancelled acquire
                // would otherwise strand the bucket in cooling_down forever
                let bucket = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    bucket.finish_cooldown();
                });
                self.cooled_down.subscribe()
            }
        };

        let start = Instant::now();
        // Err only if the sender is gone, which cannot outlast the bucket
        let _ = cooled.wait_for(|cooled| *cooled).await;
        start.elapsed()
    }

    fn finish_cooldown(&self) {
        let mut state = self.state.lock();
        state.cooling_down = false;
        if matches!(self.quota, Quota::FixedWindow { .. }) {
            state.window_started = Some(Instant::now());
            state.used = 0;
        }
        drop(state);
        self.cooled_down.send_replace(true);
    }

    /// Overwrite the bucket with the server's most recent view.
    fn update(&self, info: &RateLimitInfo) {
        // All-or-nothing: no remaining header means no rate-limit info at all
        let Some(remaining) = info.remaining else {
            return;
        };

        let mut state = self.state.lock();
        state.remaining = remaining;
        state.reset = info.reset;
        state.date = info.date;
    }
}

/// Rate limiter tracking cooldown buckets across the process lifetime.
///
/// Buckets are created lazily on the first response observed for a key;
/// `acquire` for an unknown key always passes immediately.
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Arc<CooldownBucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Register a fixed-window bucket with a quota known up front.
    ///
    /// Used by the gateway send path, which budgets itself more
    /// conservatively than the documented allowance so server-requested
    /// heartbeats always have headroom on the same connection.
    pub fn declare_fixed_window(&self, key: BucketKey, limit: u32, window: Duration) {
        self.buckets.insert(
            key.clone(),
            Arc::new(CooldownBucket::new(key, Quota::FixedWindow { limit, window })),
        );
    }

    /// Suspend until a request to `key` is safe, checking the global bucket
    /// first. Returns the total time spent suspended, for diagnostics.
    pub async fn acquire(&self, key: &BucketKey) -> Duration {
        self.limit_duration(&BucketKey::Global).await + self.limit_duration(key).await
    }

    async fn limit_duration(&self, key: &BucketKey) -> Duration {
        // Clone out of the map so no shard lock is held across the await
        let Some(bucket) = self.buckets.get(key).map(|b| Arc::clone(&b)) else {
            return Duration::ZERO;
        };
        bucket.acquire().await
    }

    /// Record the server's rate-limit view after a request completed.
    ///
    /// A response flagged as global is accounted against the global bucket
    /// regardless of the route that triggered it.
    pub fn update(&self, key: &BucketKey, info: &RateLimitInfo) {
        let target = if info.global {
            BucketKey::Global
        } else {
            key.clone()
        };

        let bucket = self
            .buckets
            .entry(target.clone())
            .or_insert_with(|| Arc::new(CooldownBucket::new(target, Quota::HeaderDriven)))
            .clone();
        bucket.update(info);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
