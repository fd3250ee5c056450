//! Failure classification and the retry table
//!
//! Providers report throttling only through the failure text, so the
//! classification is marker based. Waits are expressed in backoff units;
//! the orchestrator turns them into durations.

use super::endpoint::Endpoint;

/// Class of a failed completion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Upstream temporarily overloaded
    Unavailable,
    /// Rate limited with a wait hint in units
    RateLimited { wait: u64 },
    /// Rate-limit marker present but no usable number after it
    MalformedWaitHint,
    Other,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Unavailable => "unavailable",
            FailureClass::RateLimited { .. } => "rate_limited",
            FailureClass::MalformedWaitHint => "malformed_wait_hint",
            FailureClass::Other => "other",
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Sleep for the given units, then retry
    Backoff(u64),
    /// Evict history, sleep, then retry on the same endpoint
    EvictAndWait(u64),
    /// Evict history, switch to the fallback endpoint for the given units,
    /// retry immediately
    EvictAndFailover(u64),
    Abort,
}

/// Retry table and failure markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff units per attempt for unavailable upstreams
    pub backoff_step: u64,
    pub unavailable_marker: String,
    pub rate_limit_marker: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: 3,
            unavailable_marker: "Service Unavailable".to_string(),
            rate_limit_marker: "Please try again in".to_string(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Classify a failure from its text
    pub fn classify(&self, failure: &str) -> FailureClass {
        if failure.contains(&self.unavailable_marker) {
            return FailureClass::Unavailable;
        }

        match failure.find(&self.rate_limit_marker) {
            Some(idx) => match first_number(&failure[idx + self.rate_limit_marker.len()..]) {
                Some(wait) => FailureClass::RateLimited { wait },
                None => FailureClass::MalformedWaitHint,
            },
            None => FailureClass::Other,
        }
    }

    /// Action for `class` on the 1-based `attempt` made against `endpoint`
    pub fn action(&self, class: FailureClass, attempt: u32, endpoint: Endpoint) -> RetryAction {
        match (class, endpoint) {
            (FailureClass::Unavailable, _) => RetryAction::Backoff(u64::from(attempt) * self.backoff_step),
            (FailureClass::RateLimited { wait }, Endpoint::Fallback) => {
                RetryAction::EvictAndWait(wait.saturating_add(1))
            }
            (FailureClass::RateLimited { wait }, Endpoint::Primary) => {
                RetryAction::EvictAndFailover(wait.saturating_add(1))
            }
            (FailureClass::MalformedWaitHint, _) | (FailureClass::Other, _) => RetryAction::Abort,
        }
    }
}

/// First run of ASCII digits in `text`, if it fits in a u64
fn first_number(text: &str) -> Option<u64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: &str = &text[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}
