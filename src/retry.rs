use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

/// How a failed remote call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The server signalled overload; back off and try again.
    RateLimited,
    /// The operation ran out of time; back off and try again, possibly smaller.
    Timeout,
    /// Anything else. The unit of work is abandoned.
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::RateLimited | FailureKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::Fatal => "fatal",
        }
    }
}

fn rate_limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b429\b|too\s*many\s*requests|request\s*rate\s*(is\s*)?too\s*large")
            .expect("valid rate limit pattern")
    })
}

fn timeout_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)GraphTimeoutException|\b408\b|timed?\s*out|operation\s*timeout")
            .expect("valid timeout pattern")
    })
}

/// Classifies a protocol failure from its HTTP status (when there is one) and
/// whatever message the server sent back.
pub fn classify(status: Option<u16>, message: &str) -> FailureKind {
    match status {
        Some(429) => return FailureKind::RateLimited,
        Some(408) | Some(504) => return FailureKind::Timeout,
        _ => {}
    }
    if rate_limit_pattern().is_match(message) {
        FailureKind::RateLimited
    } else if timeout_pattern().is_match(message) {
        FailureKind::Timeout
    } else {
        FailureKind::Fatal
    }
}

/// Exponential backoff with additive jitter.
///
/// `max_retries` is the total number of attempts a unit of work gets; the
/// delay before retry `i` (1-based) is at least `base * 2^(i-1)` until that
/// term reaches `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }

    /// Deterministic part of the delay before retry `attempt`.
    pub fn floor_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let scaled = self.base.saturating_mul(1u32 << exponent);
        scaled.min(self.max_delay)
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let floor = self.floor_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || floor.is_zero() {
            return floor;
        }
        floor + floor.mul_f64(jitter * unit_random())
    }

    pub fn backoff(&self) -> ExhaustibleBackoff {
        ExhaustibleBackoff {
            policy: *self,
            retries: 0,
        }
    }
}

fn unit_random() -> f64 {
    match getrandom::u64() {
        Ok(bits) => (bits >> 11) as f64 / (1u64 << 53) as f64,
        Err(_) => 0.5,
    }
}

/// A [`backoff::backoff::Backoff`] that gives up once the policy's attempt
/// budget is spent.
#[derive(Debug, Clone)]
pub struct ExhaustibleBackoff {
    policy: RetryPolicy,
    retries: usize,
}

impl backoff::backoff::Backoff for ExhaustibleBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.retries += 1;
        if self.retries >= self.policy.attempts() {
            return None;
        }
        Some(self.policy.delay(self.retries))
    }
}

/// Counts retries per failure kind across every worker of a run.
#[derive(Debug, Default)]
pub struct RetryTracker {
    total_retries: AtomicUsize,
    counts_by_kind: Mutex<BTreeMap<FailureKind, usize>>,
}

impl RetryTracker {
    pub fn record(&self, kind: FailureKind) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        let mut counts = match self.counts_by_kind.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counts.entry(kind).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> BTreeMap<FailureKind, usize> {
        match self.counts_by_kind.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn summary_line(&self) -> Option<String> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let detail = self
            .counts()
            .iter()
            .map(|(kind, count)| format!("{} {count}", kind.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("retries: {total} ({detail})"))
    }
}
