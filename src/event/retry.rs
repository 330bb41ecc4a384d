//! Per-kind retry and backoff policies.
//!
//! Policies are plain values passed into the publisher, subscriber and
//! handlers. There is no process-wide table.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EventKind;
use crate::error::PipelineError;

// =============================================================================
// Retry Policy
// =============================================================================

/// Backoff schedule and attempt ceiling for one event kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// Build a policy. The multiplier must be finite and non-negative.
    pub fn new(
        max_attempts: u32,
        base_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
    ) -> Result<Self, PipelineError> {
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(PipelineError::Validation(format!(
                "retry multiplier must be finite and non-negative, got {multiplier}"
            )));
        }
        if max_attempts == 0 {
            return Err(PipelineError::Validation(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            base_backoff,
            max_backoff,
            multiplier,
        })
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay before retrying after `attempt` failures:
    /// `min(base × multiplier × attempt, max_backoff)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.base_backoff.as_secs_f64() * self.multiplier * f64::from(attempt);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Retry metadata for the first attempt of a message.
    pub fn first_attempt(&self) -> RetryMetadata {
        let now = Utc::now();
        self.metadata(1, now, now)
    }

    /// Retry metadata after `attempt` attempts.
    pub fn metadata(
        &self,
        attempt: u32,
        first_attempt_at: DateTime<Utc>,
        last_attempt_at: DateTime<Utc>,
    ) -> RetryMetadata {
        RetryMetadata {
            attempt_count: attempt,
            max_attempts: self.max_attempts,
            first_attempt_at,
            last_attempt_at,
            backoff: self.backoff(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Parse `kind:max_attempts:base_ms:max_ms:multiplier`.
///
/// Used as a clap value parser for `--retry-policy`.
pub fn parse_policy_override(s: &str) -> Result<(EventKind, RetryPolicy), String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [kind, max_attempts, base_ms, max_ms, multiplier] = parts.as_slice() else {
        return Err(format!(
            "expected kind:max_attempts:base_ms:max_ms:multiplier, got '{s}'"
        ));
    };

    let kind: EventKind = kind.parse().map_err(|e| format!("{e}"))?;
    let max_attempts: u32 = max_attempts
        .parse()
        .map_err(|_| format!("invalid max_attempts '{max_attempts}'"))?;
    let base_ms: u64 = base_ms
        .parse()
        .map_err(|_| format!("invalid base backoff '{base_ms}'"))?;
    let max_ms: u64 = max_ms
        .parse()
        .map_err(|_| format!("invalid max backoff '{max_ms}'"))?;
    let multiplier: f64 = multiplier
        .parse()
        .map_err(|_| format!("invalid multiplier '{multiplier}'"))?;

    let policy = RetryPolicy::new(
        max_attempts,
        Duration::from_millis(base_ms),
        Duration::from_millis(max_ms),
        multiplier,
    )
    .map_err(|e| e.to_string())?;
    Ok((kind, policy))
}

// =============================================================================
// Policy Table
// =============================================================================

/// Kind → policy map with a fallback default.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_kind: HashMap<EventKind, RetryPolicy>,
}

impl RetryPolicies {
    /// Empty table where every kind uses `default`.
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    /// Set the policy for one kind.
    pub fn with(mut self, kind: EventKind, policy: RetryPolicy) -> Self {
        self.by_kind.insert(kind, policy);
        self
    }

    pub fn set(&mut self, kind: EventKind, policy: RetryPolicy) {
        self.by_kind.insert(kind, policy);
    }

    pub fn for_kind(&self, kind: EventKind) -> &RetryPolicy {
        self.by_kind.get(&kind).unwrap_or(&self.default)
    }
}

impl Default for RetryPolicies {
    /// Production defaults. The worker call is slow and expensive, so
    /// processing requests back off the longest; the DLQ never retries.
    fn default() -> Self {
        let policy = |max_attempts, base_secs, max_secs| RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_secs(base_secs),
            max_backoff: Duration::from_secs(max_secs),
            multiplier: 2.0,
        };

        Self::new(RetryPolicy::default())
            .with(EventKind::Uploaded, policy(3, 1, 30))
            .with(EventKind::Delete, policy(3, 1, 30))
            .with(EventKind::DeleteFile, policy(3, 1, 30))
            .with(EventKind::ImageProcessRequested, policy(5, 10, 300))
            .with(EventKind::ImageProcessCompleted, policy(5, 1, 60))
            .with(EventKind::NewFileExist, policy(5, 1, 30))
            .with(EventKind::ImageProcessDlq, RetryPolicy::no_retry())
    }
}

// =============================================================================
// Retry Metadata
// =============================================================================

/// Delivery history carried on failure events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetadata {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,

    /// Backoff applied before the next attempt, in milliseconds on the wire
    #[serde(rename = "backoff_ms", with = "duration_ms")]
    pub backoff: Duration,
}

impl RetryMetadata {
    pub fn should_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(
            5,
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            multiplier,
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_formula() {
        let p = policy(100, 10_000, 2.0);
        assert_eq!(p.backoff(0), Duration::ZERO);
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(600));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        for multiplier in [0.0, 0.5, 1.0, 2.0, 10.0] {
            let p = policy(250, 5_000, multiplier);
            let mut previous = Duration::ZERO;
            for attempt in 0..200 {
                let delay = p.backoff(attempt);
                assert!(delay >= previous, "attempt {attempt} went backwards");
                assert!(delay <= p.max_backoff());
                previous = delay;
            }
        }
    }

    #[test]
    fn test_backoff_saturates_on_huge_attempts() {
        let p = policy(1_000, 60_000, 1e300);
        assert_eq!(p.backoff(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        for multiplier in [-1.0, f64::NAN, f64::INFINITY] {
            let result = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, multiplier);
            assert!(matches!(result, Err(PipelineError::Validation(_))));
        }
    }

    #[test]
    fn test_should_retry() {
        let p = policy(1, 1, 1.0);
        assert!(p.should_retry(4));
        assert!(!p.should_retry(5));

        let meta = p.metadata(5, Utc::now(), Utc::now());
        assert!(!meta.should_retry());
    }

    #[test]
    fn test_policy_table_fallback() {
        let custom = policy(1, 2, 1.0);
        let table = RetryPolicies::new(RetryPolicy::default()).with(EventKind::Delete, custom);
        assert_eq!(table.for_kind(EventKind::Delete), &custom);
        assert_eq!(table.for_kind(EventKind::Uploaded), &RetryPolicy::default());
    }

    #[test]
    fn test_default_dlq_never_retries() {
        let table = RetryPolicies::default();
        assert!(!table.for_kind(EventKind::ImageProcessDlq).should_retry(1));
    }

    #[test]
    fn test_parse_policy_override() {
        let (kind, p) = parse_policy_override("new_file_exist:7:100:2000:1.5").unwrap();
        assert_eq!(kind, EventKind::NewFileExist);
        assert_eq!(p.max_attempts(), 7);
        assert_eq!(p.base_backoff(), Duration::from_millis(100));
        assert_eq!(p.max_backoff(), Duration::from_millis(2000));
        assert_eq!(p.multiplier(), 1.5);

        assert!(parse_policy_override("new_file_exist:7:100").is_err());
        assert!(parse_policy_override("bogus:1:1:1:1").is_err());
        assert!(parse_policy_override("delete:1:1:1:-2").is_err());
    }

    #[test]
    fn test_metadata_wire_format() {
        let meta = policy(500, 10_000, 2.0).first_attempt();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["backoff_ms"], 1000);
        let back: RetryMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
