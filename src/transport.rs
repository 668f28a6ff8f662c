//! Transport layer for delivering marshaled payloads to a collector

use crate::errors::{ExporterError, Result};
use crate::marshal::MarshaledPayload;
use crate::retry::{FailureReason, RetryDecision, RetryPolicy};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, warn};

/// A single failed send, as reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl SendFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Turn the last failure of an export into the error surfaced to the caller.
    pub fn into_export_error(self, attempts: u32) -> ExporterError {
        if self.reason.is_transient() {
            ExporterError::TransientExport {
                attempts,
                reason: self.reason,
                message: self.message,
            }
        } else {
            ExporterError::PermanentExport {
                attempts,
                reason: self.reason,
                message: self.message,
            }
        }
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Sends one opaque payload per call. Implementations must tolerate concurrent sends.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, payload: &MarshaledPayload) -> std::result::Result<(), SendFailure>;

    /// Release connections. Called once when the owning exporter terminates.
    async fn shutdown(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(FailureReason),
}

/// One physical send made while exporting a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportAttempt {
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Wraps a transport and re-sends the same payload while the retry policy allows it.
#[derive(Debug)]
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    policy: Arc<RetryPolicy>,
    metrics: TransportMetrics,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: Arc<RetryPolicy>) -> Self {
        Self {
            inner,
            policy,
            metrics: TransportMetrics::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `payload`, returning every attempt made when one finally succeeds.
    pub async fn deliver(&self, payload: &MarshaledPayload) -> Result<Vec<ExportAttempt>> {
        let mut attempts = Vec::new();
        let mut attempt_number = 0;

        loop {
            attempt_number += 1;
            let started = Instant::now();
            self.metrics.sends.fetch_add(1, Ordering::Relaxed);

            match self.inner.send(payload).await {
                Ok(()) => {
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    attempts.push(ExportAttempt {
                        attempt_number,
                        outcome: AttemptOutcome::Success,
                        elapsed: started.elapsed(),
                    });
                    debug!(
                        "Delivered {} bytes on attempt {}",
                        payload.len(),
                        attempt_number
                    );
                    return Ok(attempts);
                }
                Err(failure) => {
                    attempts.push(ExportAttempt {
                        attempt_number,
                        outcome: AttemptOutcome::Failed(failure.reason),
                        elapsed: started.elapsed(),
                    });

                    match self.policy.decide(attempt_number, failure.reason.class()) {
                        RetryDecision::RetryAfter(backoff) => {
                            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "Send failed (attempt {}), retrying in {}ms: {}",
                                attempt_number,
                                backoff.as_millis(),
                                failure
                            );
                            sleep(backoff).await;
                        }
                        RetryDecision::Stop => {
                            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "Giving up after {} attempts: {}",
                                attempt_number, failure
                            );
                            return Err(failure.into_export_error(attempt_number));
                        }
                    }
                }
            }
        }
    }

    pub fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[async_trait]
impl Transport for RetryingTransport {
    async fn send(&self, payload: &MarshaledPayload) -> std::result::Result<(), SendFailure> {
        match self.deliver(payload).await {
            Ok(_) => Ok(()),
            Err(
                ExporterError::TransientExport { reason, message, .. }
                | ExporterError::PermanentExport { reason, message, .. },
            ) => Err(SendFailure::new(reason, message)),
            Err(other) => Err(SendFailure::new(FailureReason::PayloadRejected, other.to_string())),
        }
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

#[derive(Debug, Default)]
struct TransportMetrics {
    sends: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl TransportMetrics {
    fn snapshot(&self) -> TransportMetricsSnapshot {
        let sends = self.sends.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);

        let success_rate = if sends > 0 {
            (successes as f64 / sends as f64) * 100.0
        } else {
            0.0
        };

        TransportMetricsSnapshot {
            sends,
            successes,
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

/// Snapshot of transport counters
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMetricsSnapshot {
    pub sends: u64,
    pub successes: u64,
    pub retries: u64,
    pub failures: u64,
    pub success_rate: f64,
}

/// OTLP/HTTP transport posting protobuf payloads
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: String, request_timeout: Duration, headers: &BTreeMap<String, String>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExporterError::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExporterError::Config(format!("invalid value for header {}: {}", name, e)))?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .default_headers(default_headers)
            .user_agent(format!("otlp_exporter/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ExporterError::Http)?;

        Ok(Self {
            client,
            url,
            timeout: request_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn handle_response(&self, response: Response) -> std::result::Result<(), SendFailure> {
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        let reason = FailureReason::from_http_status(status.as_u16());

        let message = match status.as_u16() {
            400 => format!("Bad request: {}", error_body),
            401 | 403 => format!("Not authorized ({}): {}", status, error_body),
            404 => format!("Collector endpoint {} not found: {}", self.url, error_body),
            413 => format!("Payload too large: {}", error_body),
            429 => format!("Rate limited: {}", error_body),
            500..=599 => format!("Collector server error {}: {}", status, error_body),
            _ => format!("Unexpected response {}: {}", status, error_body),
        };

        Err(SendFailure::new(reason, message))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &MarshaledPayload) -> std::result::Result<(), SendFailure> {
        let request = self.client.post(&self.url).body(payload.bytes()).send();

        let response = match timeout(self.timeout, request).await {
            Err(_) => {
                return Err(SendFailure::new(FailureReason::DeadlineExceeded, "Request timeout"));
            }
            Ok(Err(err)) if err.is_timeout() => {
                return Err(SendFailure::new(FailureReason::DeadlineExceeded, err.to_string()));
            }
            Ok(Err(err)) => {
                return Err(SendFailure::new(FailureReason::Unavailable, err.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        self.handle_response(response).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted outcomes and records every payload it was given.
    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        outcomes: Mutex<VecDeque<std::result::Result<(), SendFailure>>>,
        received: Mutex<Vec<Vec<u8>>>,
        delay: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_outcomes(outcomes: Vec<std::result::Result<(), SendFailure>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn received(&self) -> Vec<Vec<u8>> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, payload: &MarshaledPayload) -> std::result::Result<(), SendFailure> {
            self.received.lock().unwrap().push(payload.to_vec());
            if let Some(delay) = self.delay {
                sleep(delay).await;
            }
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    pub fn transient(reason: FailureReason) -> std::result::Result<(), SendFailure> {
        Err(SendFailure::new(reason, "scripted transient failure"))
    }

    pub fn permanent(reason: FailureReason) -> std::result::Result<(), SendFailure> {
        Err(SendFailure::new(reason, "scripted permanent failure"))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> Arc<RetryPolicy> {
        Arc::new(
            RetryPolicy::builder()
                .max_attempts(max_attempts)
                .initial_backoff(Duration::from_millis(10))
                .max_backoff(Duration::from_millis(50))
                .build()
                .unwrap(),
        )
    }

    fn payload() -> MarshaledPayload {
        MarshaledPayload::from(vec![0x0a, 0x02, 0x01, 0x02])
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_resend_identical_payload() {
        let scripted = Arc::new(ScriptedTransport::with_outcomes(vec![
            transient(FailureReason::Unavailable),
            transient(FailureReason::DeadlineExceeded),
            Ok(()),
        ]));
        let transport = RetryingTransport::new(scripted.clone(), fast_policy(5));

        let attempts = assert_ok!(transport.deliver(&payload()).await);

        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed(FailureReason::Unavailable));
        assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
        let received = scripted.received();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|bytes| bytes == &payload().to_vec()));

        let metrics = transport.metrics();
        assert_eq!(metrics.sends, 3);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let scripted = Arc::new(ScriptedTransport::with_outcomes(
            (0..10).map(|_| transient(FailureReason::ServerBusy)).collect(),
        ));
        let transport = RetryingTransport::new(scripted.clone(), fast_policy(3));

        let err = assert_err!(transport.deliver(&payload()).await);

        assert!(err.is_retryable());
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(scripted.received().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let scripted = Arc::new(ScriptedTransport::with_outcomes(vec![permanent(
            FailureReason::Unauthenticated,
        )]));
        let transport = RetryingTransport::new(scripted.clone(), fast_policy(5));

        let err = assert_err!(transport.deliver(&payload()).await);

        assert!(matches!(err, ExporterError::PermanentExport { attempts: 1, .. }));
        assert_eq!(scripted.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_transport_satisfies_transport_contract() {
        let scripted = Arc::new(ScriptedTransport::with_outcomes(vec![permanent(
            FailureReason::PayloadRejected,
        )]));
        let transport: Arc<dyn Transport> = Arc::new(RetryingTransport::new(scripted, fast_policy(2)));

        let failure = transport.send(&payload()).await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::PayloadRejected);
    }

    #[tokio::test]
    async fn test_http_transport_posts_protobuf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("content-type", "application/x-protobuf"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let headers = BTreeMap::from([("x-api-key".to_string(), "secret".to_string())]);
        let transport = HttpTransport::new(
            format!("{}/v1/traces", server.uri()),
            Duration::from_secs(5),
            &headers,
        )
        .unwrap();

        assert_ok!(transport.send(&payload()).await);
    }

    #[tokio::test]
    async fn test_http_transport_classifies_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/logs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/metrics"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let logs = HttpTransport::new(format!("{}/v1/logs", server.uri()), Duration::from_secs(5), &BTreeMap::new()).unwrap();
        let metrics = HttpTransport::new(format!("{}/v1/metrics", server.uri()), Duration::from_secs(5), &BTreeMap::new()).unwrap();

        let failure = logs.send(&payload()).await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::Unavailable);
        assert!(failure.message.contains("overloaded"));

        let failure = metrics.send(&payload()).await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::Unauthenticated);
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let headers = BTreeMap::from([("bad header".to_string(), "v".to_string())]);
        let result = HttpTransport::new("http://localhost:4318/v1/traces".to_string(), Duration::from_secs(1), &headers);

        assert!(matches!(result, Err(ExporterError::Config(_))));
    }
}
