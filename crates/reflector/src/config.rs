use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// What to do when a watch stream ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Relist on every watch failure. The source may have expired the last
    /// version, so a fresh snapshot is the only position that is always valid.
    #[default]
    Relist,
    /// Re-open the watch from the last applied version after a closed or failed
    /// stream; relist when the watch cannot be opened, dies before applying an
    /// event, or reports that the resume version has expired.
    ResumeWatch,
}

impl ResumePolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "relist" => Some(ResumePolicy::Relist),
            "watch" | "resume" => Some(ResumePolicy::ResumeWatch),
            _ => None,
        }
    }
}

/// Delay before the next list/watch cycle after `failures` consecutive failures (>= 1).
pub trait RetryPolicy: Send + Sync + Debug {
    fn delay(&self, failures: u32) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl RetryPolicy for FixedDelay {
    fn delay(&self, _failures: u32) -> Duration { self.0 }
}

/// `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub resume: ResumePolicy,
    /// A watch closing sooner than this with no events counts as a failure.
    pub min_watch: Duration,
    pub retry: Arc<dyn RetryPolicy>,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resume: ResumePolicy::Relist,
            min_watch: Duration::from_secs(1),
            retry: Arc::new(FixedDelay(Duration::from_secs(1))),
        }
    }
}

impl ReflectorConfig {
    /// Read overrides from `REFLEX_RESUME`, `REFLEX_RETRY_MS`, `REFLEX_RETRY_MAX_MS`
    /// and `REFLEX_MIN_WATCH_MS`.
    pub fn from_env() -> Self {
        let resume = std::env::var("REFLEX_RESUME").ok().and_then(|s| ResumePolicy::parse(&s)).unwrap_or_default();
        let retry_ms = std::env::var("REFLEX_RETRY_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
        let retry_max_ms = std::env::var("REFLEX_RETRY_MAX_MS").ok().and_then(|s| s.parse::<u64>().ok());
        let min_watch_ms = std::env::var("REFLEX_MIN_WATCH_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
        let retry: Arc<dyn RetryPolicy> = match retry_max_ms {
            Some(max) => Arc::new(ExponentialBackoff {
                base: Duration::from_millis(retry_ms),
                max: Duration::from_millis(max.max(retry_ms)),
            }),
            None => Arc::new(FixedDelay(Duration::from_millis(retry_ms))),
        };
        Self { resume, min_watch: Duration::from_millis(min_watch_ms), retry }
    }

    pub fn with_resume(mut self, resume: ResumePolicy) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_retry(mut self, retry: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    pub fn with_min_watch(mut self, min_watch: Duration) -> Self {
        self.min_watch = min_watch;
        self
    }
}
