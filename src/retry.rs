//! Retry policy and failure classification for export attempts

use crate::errors::{ExporterError, Result};
use rand::Rng;
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Why a single send attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    ServerBusy,
    InvalidArgument,
    Unauthenticated,
    PayloadRejected,
}

impl FailureReason {
    pub fn class(&self) -> FailureClass {
        match self {
            FailureReason::Unavailable
            | FailureReason::DeadlineExceeded
            | FailureReason::ResourceExhausted
            | FailureReason::ServerBusy => FailureClass::Transient,
            FailureReason::InvalidArgument
            | FailureReason::Unauthenticated
            | FailureReason::PayloadRejected => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Classify an HTTP response status that was not a success.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => FailureReason::ResourceExhausted,
            502 | 503 => FailureReason::Unavailable,
            504 => FailureReason::DeadlineExceeded,
            400 => FailureReason::InvalidArgument,
            401 | 403 => FailureReason::Unauthenticated,
            500..=599 => FailureReason::ServerBusy,
            _ => FailureReason::PayloadRejected,
        }
    }

    /// Classify a gRPC status code, following the OTLP list of retryable codes.
    pub fn from_grpc_code(code: tonic::Code) -> Self {
        use tonic::Code;

        match code {
            Code::Unavailable | Code::Cancelled | Code::Aborted | Code::DataLoss => {
                FailureReason::Unavailable
            }
            Code::DeadlineExceeded => FailureReason::DeadlineExceeded,
            Code::ResourceExhausted | Code::OutOfRange => FailureReason::ResourceExhausted,
            Code::Unauthenticated | Code::PermissionDenied => FailureReason::Unauthenticated,
            Code::InvalidArgument => FailureReason::InvalidArgument,
            _ => FailureReason::PayloadRejected,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::Unavailable => "unavailable",
            FailureReason::DeadlineExceeded => "deadline exceeded",
            FailureReason::ResourceExhausted => "resource exhausted",
            FailureReason::ServerBusy => "server busy",
            FailureReason::InvalidArgument => "invalid argument",
            FailureReason::Unauthenticated => "unauthenticated",
            FailureReason::PayloadRejected => "payload rejected",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    Stop,
    RetryAfter(Duration),
}

/// Immutable backoff settings shared by every exporter built from the same configuration.
///
/// Only [`RetryPolicy::builder`], [`Default`] and [`RetryPolicy::no_retry`] construct one, so
/// every policy in use has passed [`RetryPolicy::validate`].
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_multiplier: f64,
    jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// A policy that sends once and never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ExporterError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.initial_backoff.is_zero() || self.max_backoff.is_zero() {
            return Err(ExporterError::Config("backoff durations must be greater than 0".to_string()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ExporterError::Config(
                "initial_backoff must not exceed max_backoff".to_string(),
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ExporterError::Config("backoff_multiplier must be at least 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ExporterError::Config(
                "jitter_fraction must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Decide what to do after attempt `attempt` (1-based) failed with `class`.
    pub fn decide(&self, attempt: u32, class: FailureClass) -> RetryDecision {
        self.decide_with(attempt, class, &mut rand::rng())
    }

    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        class: FailureClass,
        rng: &mut R,
    ) -> RetryDecision {
        if class == FailureClass::Permanent || attempt >= self.max_attempts {
            return RetryDecision::Stop;
        }

        let base = self.base_backoff(attempt);
        // NaN and non-positive fractions mean no jitter; the factor never drops below zero.
        if self.jitter_fraction.is_nan() || self.jitter_fraction <= 0.0 {
            return RetryDecision::RetryAfter(base);
        }
        let jitter = self.jitter_fraction.min(1.0);
        let factor = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
        RetryDecision::RetryAfter(base.mul_f64(factor.max(0.0)))
    }

    /// Backoff before jitter: `min(max, initial * multiplier^(attempt - 1))`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.policy.initial_backoff = initial_backoff;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.policy.max_backoff = max_backoff;
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.policy.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn jitter_fraction(mut self, jitter_fraction: f64) -> Self {
        self.policy.jitter_fraction = jitter_fraction;
        self
    }

    pub fn build(self) -> Result<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy_without_jitter() -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(5)
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(400))
            .backoff_multiplier(2.0)
            .jitter_fraction(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_multiplier, 1.5);
    }

    #[test]
    fn test_backoff_grows_then_clamps() {
        let policy = policy_without_jitter();

        assert_eq!(policy.decide(1, FailureClass::Transient), RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(policy.decide(2, FailureClass::Transient), RetryDecision::RetryAfter(Duration::from_millis(200)));
        assert_eq!(policy.decide(3, FailureClass::Transient), RetryDecision::RetryAfter(Duration::from_millis(400)));
        assert_eq!(policy.decide(4, FailureClass::Transient), RetryDecision::RetryAfter(Duration::from_millis(400)));
    }

    #[test]
    fn test_stops_once_attempts_are_exhausted() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in policy.max_attempts..policy.max_attempts + 20 {
            assert_eq!(
                policy.decide_with(attempt, FailureClass::Transient, &mut rng),
                RetryDecision::Stop
            );
        }
    }

    #[test]
    fn test_base_backoff_is_monotonic() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;

        for attempt in 1..64 {
            let delay = policy.base_backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= policy.max_backoff);
            previous = delay;
        }
        assert_eq!(policy.base_backoff(1_000), policy.max_backoff);
    }

    #[test]
    fn test_permanent_failure_stops_immediately() {
        let policy = RetryPolicy::builder().max_attempts(100).build().unwrap();

        assert_eq!(policy.decide(1, FailureClass::Permanent), RetryDecision::Stop);
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 1..policy.max_attempts {
            let base = policy.base_backoff(attempt);
            for _ in 0..50 {
                match policy.decide_with(attempt, FailureClass::Transient, &mut rng) {
                    RetryDecision::RetryAfter(delay) => {
                        assert!(delay >= base.mul_f64(0.8));
                        assert!(delay <= base.mul_f64(1.2));
                    }
                    RetryDecision::Stop => panic!("stopped early on attempt {}", attempt),
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_jitter_never_yields_negative_delay() {
        let mut rng = StdRng::seed_from_u64(3);
        for jitter_fraction in [1.5, 7.0, f64::NAN, -0.5] {
            let policy = RetryPolicy {
                jitter_fraction,
                ..RetryPolicy::default()
            };
            for _ in 0..200 {
                match policy.decide_with(1, FailureClass::Transient, &mut rng) {
                    RetryDecision::RetryAfter(delay) => assert!(delay <= policy.initial_backoff * 2),
                    RetryDecision::Stop => panic!("stopped on first attempt with jitter {}", jitter_fraction),
                }
            }
        }
    }

    #[test]
    fn test_builder_rejects_invalid_settings() {
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder().jitter_fraction(1.5).build().is_err());
        assert!(RetryPolicy::builder().backoff_multiplier(0.5).build().is_err());
        assert!(RetryPolicy::builder().initial_backoff(Duration::ZERO).build().is_err());
        assert!(
            RetryPolicy::builder()
                .initial_backoff(Duration::from_secs(10))
                .max_backoff(Duration::from_secs(1))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(FailureReason::from_http_status(503).class(), FailureClass::Transient);
        assert_eq!(FailureReason::from_http_status(429), FailureReason::ResourceExhausted);
        assert_eq!(FailureReason::from_http_status(504), FailureReason::DeadlineExceeded);
        assert_eq!(FailureReason::from_http_status(500).class(), FailureClass::Transient);
        assert_eq!(FailureReason::from_http_status(400), FailureReason::InvalidArgument);
        assert_eq!(FailureReason::from_http_status(401), FailureReason::Unauthenticated);
        assert_eq!(FailureReason::from_http_status(413).class(), FailureClass::Permanent);
        assert_eq!(FailureReason::from_http_status(408).class(), FailureClass::Permanent);
    }

    #[test]
    fn test_grpc_code_classification() {
        use tonic::Code;

        for code in [Code::Unavailable, Code::DeadlineExceeded, Code::ResourceExhausted, Code::Aborted] {
            assert!(FailureReason::from_grpc_code(code).is_transient(), "{:?}", code);
        }
        for code in [Code::InvalidArgument, Code::Unauthenticated, Code::NotFound, Code::Internal] {
            assert!(!FailureReason::from_grpc_code(code).is_transient(), "{:?}", code);
        }
    }
}
