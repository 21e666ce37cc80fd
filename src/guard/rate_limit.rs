//! In-process rate limiting with escalating blocks.
//!
//! Flow Overview:
//! 1) Count attempts per client inside a fixed window starting at the first attempt.
//! 2) Once the count exceeds the policy maximum, block the client for the block duration.
//! 3) A block or window that has run out starts the client over with a fresh window.
//!
//! Scaling: state lives in this process only; each instance enforces its own limits.

use crate::clock::Clock;
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl RateLimitPolicy {
    pub const LOGIN: Self = Self::new(5, Duration::from_secs(15 * 60), Duration::from_secs(60 * 60));
    pub const ADMIN: Self = Self::new(10, Duration::from_secs(10 * 60), Duration::from_secs(30 * 60));
    pub const UPLOAD: Self = Self::new(20, Duration::from_secs(60), Duration::from_secs(5 * 60));

    #[must_use]
    pub const fn new(max_attempts: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            max_attempts,
            window,
            block_duration,
        }
    }
}

/// `max_attempts/window_seconds/block_seconds`, e.g. `5/900/3600`.
impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split('/').map(str::trim).collect();
        let [max_attempts, window, block] = parts.as_slice() else {
            return Err(format!(
                "expected max_attempts/window_seconds/block_seconds, got '{value}'"
            ));
        };

        let max_attempts: u32 = max_attempts
            .parse()
            .map_err(|_| format!("invalid max attempts '{max_attempts}'"))?;
        let window: u64 = window
            .parse()
            .map_err(|_| format!("invalid window seconds '{window}'"))?;
        let block: u64 = block
            .parse()
            .map_err(|_| format!("invalid block seconds '{block}'"))?;

        if max_attempts == 0 || window == 0 {
            return Err("max attempts and window must be greater than zero".to_string());
        }

        Ok(Self::new(
            max_attempts,
            Duration::from_secs(window),
            Duration::from_secs(block),
        ))
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.max_attempts,
            self.window.as_secs(),
            self.block_duration.as_secs()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Too many attempts. Try again in {} minutes.", minutes_rounded_up(*retry_after))]
    Exceeded { retry_after: Duration },
    #[error("Too many attempts. Client temporarily blocked.")]
    Blocked { retry_after: Duration },
}

impl RateLimitError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Exceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Blocked { .. } => "CLIENT_BLOCKED",
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::Exceeded { retry_after } | Self::Blocked { retry_after } => *retry_after,
        }
    }

    /// Whole seconds until the client may retry, never zero.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let retry_after = self.retry_after();
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        secs.max(1)
    }
}

fn minutes_rounded_up(duration: Duration) -> u64 {
    duration.as_secs().div_ceil(60)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    attempts: u32,
    window_start: SystemTime,
    blocked_until: Option<SystemTime>,
}

impl Entry {
    fn first_attempt(now: SystemTime) -> Self {
        Self {
            attempts: 1,
            window_start: now,
            blocked_until: None,
        }
    }
}

/// Read-only view of a client's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub attempts: u32,
    pub window_start: SystemTime,
    pub blocked_until: Option<SystemTime>,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

fn elapsed(since: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or(Duration::ZERO)
}

impl RateLimiter {
    #[must_use]
    pub fn new(name: &'static str, policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            policy,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    // Entries are plain counters, so a panic mid-update cannot leave them torn.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an attempt by `client_id`.
    ///
    /// # Errors
    /// `RateLimitError::Blocked` while a block is active, and
    /// `RateLimitError::Exceeded` for the attempt that starts one.
    pub fn check(&self, client_id: &str) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let mut entries = self.entries();

        let Some(entry) = entries.get_mut(client_id) else {
            entries.insert(client_id.to_string(), Entry::first_attempt(now));
            return Ok(());
        };

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return Err(RateLimitError::Blocked {
                    retry_after: blocked_until.duration_since(now).unwrap_or(Duration::ZERO),
                });
            }
            debug!(limiter = self.name, "Block elapsed, starting a fresh window");
            *entry = Entry::first_attempt(now);
            return Ok(());
        }

        if elapsed(entry.window_start, now) >= self.policy.window {
            *entry = Entry::first_attempt(now);
            return Ok(());
        }

        entry.attempts = entry.attempts.saturating_add(1);
        if entry.attempts > self.policy.max_attempts {
            entry.blocked_until = Some(now + self.policy.block_duration);
            warn!(
                limiter = self.name,
                attempts = entry.attempts,
                block_seconds = self.policy.block_duration.as_secs(),
                "Rate limit exceeded, blocking client"
            );
            return Err(RateLimitError::Exceeded {
                retry_after: self.policy.block_duration,
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn status(&self, client_id: &str) -> Option<RateLimitStatus> {
        self.entries().get(client_id).map(|entry| RateLimitStatus {
            attempts: entry.attempts,
            window_start: entry.window_start,
            blocked_until: entry.blocked_until,
        })
    }

    /// Drop entries whose window or block has run out, returning how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let window = self.policy.window;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| match entry.blocked_until {
            Some(blocked_until) => now < blocked_until,
            None => elapsed(entry.window_start, now) < window,
        });
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`Self::sweep`] every `every` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!(limiter = self.name, removed, "Swept rate limit entries");
                }
            }
        })
    }
}

/// The limiters guarding each class of endpoint.
#[derive(Debug, Clone)]
pub struct Limiters {
    pub login: Arc<RateLimiter>,
    pub admin: Arc<RateLimiter>,
    pub upload: Arc<RateLimiter>,
}

impl Limiters {
    #[must_use]
    pub fn new(
        login: RateLimitPolicy,
        admin: RateLimitPolicy,
        upload: RateLimitPolicy,
        clock: &Arc<dyn Clock>,
    ) -> Self {
        Self {
            login: Arc::new(RateLimiter::new("login", login, clock.clone())),
            admin: Arc::new(RateLimiter::new("admin", admin, clock.clone())),
            upload: Arc::new(RateLimiter::new("upload", upload, clock.clone())),
        }
    }

    #[must_use]
    pub fn with_defaults(clock: &Arc<dyn Clock>) -> Self {
        Self::new(
            RateLimitPolicy::LOGIN,
            RateLimitPolicy::ADMIN,
            RateLimitPolicy::UPLOAD,
            clock,
        )
    }

    pub fn spawn_sweepers(&self, every: Duration) -> Vec<JoinHandle<()>> {
        [&self.login, &self.admin, &self.upload]
            .into_iter()
            .map(|limiter| limiter.clone().spawn_sweeper(every))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const POLICY: RateLimitPolicy =
        RateLimitPolicy::new(3, Duration::from_secs(60), Duration::from_secs(600));

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::starting_at_epoch_secs(1_700_000_000));
        (clock.clone(), RateLimiter::new("test", POLICY, clock))
    }

    #[test]
    fn allows_up_to_max_attempts_then_blocks() {
        let (_, limiter) = limiter();
        for _ in 0..3 {
            assert_eq!(limiter.check("client"), Ok(()));
        }
        assert_eq!(
            limiter.check("client"),
            Err(RateLimitError::Exceeded {
                retry_after: Duration::from_secs(600)
            })
        );
        assert!(matches!(
            limiter.check("client"),
            Err(RateLimitError::Blocked { .. })
        ));
        assert_eq!(limiter.check("other"), Ok(()));
    }

    #[test]
    fn window_resets_naturally() {
        let (clock, limiter) = limiter();
        for _ in 0..3 {
            assert_eq!(limiter.check("client"), Ok(()));
        }

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.check("client"), Ok(()));
        assert_eq!(limiter.status("client").map(|s| s.attempts), Some(1));
    }

    #[test]
    fn window_is_measured_from_the_first_attempt() {
        let (clock, limiter) = limiter();
        assert_eq!(limiter.check("client"), Ok(()));
        clock.advance(Duration::from_secs(40));
        assert_eq!(limiter.check("client"), Ok(()));
        assert_eq!(limiter.check("client"), Ok(()));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.check("client"), Ok(()));
        assert_eq!(limiter.status("client").map(|s| s.attempts), Some(1));
    }

    #[test]
    fn block_lasts_for_block_duration_then_resets() {
        let (clock, limiter) = limiter();
        for _ in 0..4 {
            let _ = limiter.check("client");
        }

        clock.advance(Duration::from_secs(599));
        assert_eq!(
            limiter.check("client"),
            Err(RateLimitError::Blocked {
                retry_after: Duration::from_secs(1)
            })
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.check("client"), Ok(()));
        let status = limiter.status("client").expect("status");
        assert_eq!(status.attempts, 1);
        assert_eq!(status.blocked_until, None);
    }

    #[test]
    fn status_does_not_count_as_an_attempt() {
        let (_, limiter) = limiter();
        assert_eq!(limiter.status("client"), None);
        assert_eq!(limiter.check("client"), Ok(()));
        for _ in 0..5 {
            assert_eq!(limiter.status("client").map(|s| s.attempts), Some(1));
        }
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let (clock, limiter) = limiter();
        for _ in 0..4 {
            let _ = limiter.check("blocked");
        }
        assert_eq!(limiter.check("idle"), Ok(()));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.check("active"), Ok(()));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.status("idle").is_none());
        assert!(limiter.status("blocked").is_some());
        assert!(limiter.status("active").is_some());

        clock.advance(Duration::from_secs(600));
        assert_eq!(limiter.sweep(), 2);
        assert!(limiter.is_empty());
    }

    #[test]
    fn policy_parses_triples() {
        assert_eq!("5/900/3600".parse(), Ok(RateLimitPolicy::LOGIN));
        assert_eq!(RateLimitPolicy::ADMIN.to_string(), "10/600/1800");
        assert!("5/900".parse::<RateLimitPolicy>().is_err());
        assert!("0/900/3600".parse::<RateLimitPolicy>().is_err());
        assert!("x/900/3600".parse::<RateLimitPolicy>().is_err());
    }

    #[test]
    fn error_messages_and_codes() {
        let exceeded = RateLimitError::Exceeded {
            retry_after: Duration::from_secs(3600),
        };
        assert_eq!(exceeded.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            exceeded.to_string(),
            "Too many attempts. Try again in 60 minutes."
        );
        assert_eq!(exceeded.retry_after_secs(), 3600);

        let blocked = RateLimitError::Blocked {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(blocked.code(), "CLIENT_BLOCKED");
        assert_eq!(blocked.retry_after_secs(), 2);
    }

    #[tokio::test]
    async fn sweeper_task_runs_sweep() {
        let (clock, limiter) = limiter();
        let limiter = Arc::new(limiter);
        assert_eq!(limiter.check("client"), Ok(()));
        clock.advance(Duration::from_secs(61));

        let handle = limiter.clone().spawn_sweeper(Duration::from_millis(10));
        for _ in 0..100 {
            if limiter.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(limiter.is_empty());
    }
}
