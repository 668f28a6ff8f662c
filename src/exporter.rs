//! Exporters: marshal a batch once, deliver it, and manage their own lifecycle

use crate::config::ExporterConfig;
use crate::errors::{ExporterError, Result};
use crate::lifecycle::{ExporterState, Lifecycle, ShutdownStatus};
use crate::marshal::Marshaler;
use crate::retry::RetryPolicy;
use crate::telemetry::{Signal, TelemetryBatch};
use crate::transport::{ExportAttempt, HttpTransport, RetryingTransport, Transport};
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Outcome of a successful export call
#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub batch_id: Uuid,
    pub attempts: Vec<ExportAttempt>,
    pub payload_len: usize,
    pub elapsed: Duration,
}

/// The contract every exporter satisfies. Implementations accept concurrent `export` calls.
#[async_trait]
pub trait Exporter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn export(&self, batch: &TelemetryBatch) -> Result<ExportReport>;

    /// Wait for every export issued before this call to complete.
    async fn flush(&self) -> Result<()>;

    /// Reject new exports, wait up to `timeout` for in-flight ones, then terminate.
    async fn shutdown(&self, timeout: Duration) -> Result<ShutdownStatus>;
}

/// Exports OTLP protobuf payloads over a transport, retrying transient failures.
#[derive(Debug)]
pub struct OtlpExporter {
    name: String,
    transport: RetryingTransport,
    lifecycle: Lifecycle,
}

impl OtlpExporter {
    /// Create an exporter in the `Created` state; call [`OtlpExporter::start`] before exporting.
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, policy: Arc<RetryPolicy>) -> Self {
        let name = name.into();
        Self {
            lifecycle: Lifecycle::new(name.clone()),
            transport: RetryingTransport::new(transport, policy),
            name,
        }
    }

    /// Build an active OTLP/HTTP exporter for `signal`.
    pub fn from_config(signal: Signal, config: &ExporterConfig) -> Result<Self> {
        config.validate()?;
        let url = config.endpoint_for(signal);
        let transport = HttpTransport::new(url.clone(), config.timeout, &config.headers)?;

        let exporter = Self::new(
            format!("otlp/{}", signal),
            Arc::new(transport),
            Arc::new(config.retry.clone()),
        );
        exporter.start()?;

        info!("OTLP {} exporter targeting {}", signal, url);
        Ok(exporter)
    }

    pub fn start(&self) -> Result<()> {
        self.lifecycle.activate()
    }

    pub fn state(&self) -> ExporterState {
        self.lifecycle.state()
    }

    pub fn transport(&self) -> &RetryingTransport {
        &self.transport
    }
}

#[async_trait]
impl Exporter for OtlpExporter {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(exporter = %self.name, batch = %batch.id))]
    async fn export(&self, batch: &TelemetryBatch) -> Result<ExportReport> {
        let _in_flight = self.lifecycle.begin_export()?;
        let started = Instant::now();

        let payload = Marshaler::marshal(batch).inspect_err(|e| {
            error!("Dropping batch {} of {} records: {}", batch.id, batch.len(), e);
        })?;

        debug!(
            "Sending batch {} with {} records ({} bytes)",
            batch.id,
            batch.len(),
            payload.len()
        );

        let attempts = self.transport.deliver(&payload).await?;

        Ok(ExportReport {
            batch_id: batch.id,
            attempts,
            payload_len: payload.len(),
            elapsed: started.elapsed(),
        })
    }

    async fn flush(&self) -> Result<()> {
        self.lifecycle.flush().await;
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<ShutdownStatus> {
        let Some(status) = self.lifecycle.begin_shutdown(timeout).await else {
            return Ok(ShutdownStatus::AlreadyShutDown);
        };

        self.transport.shutdown().await;
        self.lifecycle.terminate();

        let metrics = self.transport.metrics();
        info!(
            "Final transport metrics for {} - Success rate: {:.1}%, Sends: {}, Retries: {}",
            self.name, metrics.success_rate, metrics.sends, metrics.retries
        );
        Ok(status)
    }
}

/// Writes every record as a JSON line through `tracing`.
#[derive(Debug)]
pub struct LoggingExporter {
    name: String,
    lifecycle: Lifecycle,
}

impl LoggingExporter {
    pub fn new(signal: Signal) -> Result<Self> {
        let name = format!("logging/{}", signal);
        let exporter = Self {
            lifecycle: Lifecycle::new(name.clone()),
            name,
        };
        exporter.lifecycle.activate()?;
        Ok(exporter)
    }
}

#[async_trait]
impl Exporter for LoggingExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, batch: &TelemetryBatch) -> Result<ExportReport> {
        let _in_flight = self.lifecycle.begin_export()?;
        let started = Instant::now();

        let mut written = 0;
        for record in &batch.records {
            let line = serde_json::to_string(record)?;
            written += line.len();
            info!(target: "otlp_exporter::logging", batch = %batch.id, "{}", line);
        }

        Ok(ExportReport {
            batch_id: batch.id,
            attempts: Vec::new(),
            payload_len: written,
            elapsed: started.elapsed(),
        })
    }

    async fn flush(&self) -> Result<()> {
        self.lifecycle.flush().await;
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<ShutdownStatus> {
        let Some(status) = self.lifecycle.begin_shutdown(timeout).await else {
            return Ok(ShutdownStatus::AlreadyShutDown);
        };
        self.lifecycle.terminate();
        Ok(status)
    }
}

/// Sends each batch to several exporters, one after another in configured order.
///
/// The fan-out keeps its own lifecycle, so a fan-out with no members still rejects exports
/// once shut down.
#[derive(Debug)]
pub struct FanoutExporter {
    name: String,
    exporters: Vec<Box<dyn Exporter>>,
    lifecycle: Lifecycle,
}

impl FanoutExporter {
    pub fn new(exporters: Vec<Box<dyn Exporter>>) -> Self {
        let name = format!(
            "fanout[{}]",
            exporters.iter().map(|e| e.name()).collect::<Vec<_>>().join(",")
        );
        Self {
            lifecycle: Lifecycle::active(name.clone()),
            name,
            exporters,
        }
    }

    pub fn exporters(&self) -> &[Box<dyn Exporter>] {
        &self.exporters
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    pub fn state(&self) -> ExporterState {
        self.lifecycle.state()
    }
}

#[async_trait]
impl Exporter for FanoutExporter {
    fn name(&self) -> &str {
        &self.name
    }

    /// Every member sees the batch even when an earlier member fails; the first failure is
    /// returned.
    async fn export(&self, batch: &TelemetryBatch) -> Result<ExportReport> {
        let _in_flight = self.lifecycle.begin_export()?;
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut payload_len = 0;
        let mut first_error: Option<ExporterError> = None;

        for exporter in &self.exporters {
            match exporter.export(batch).await {
                Ok(report) => {
                    attempts.extend(report.attempts);
                    payload_len += report.payload_len;
                }
                Err(e) => {
                    error!("Exporter {} failed batch {}: {}", exporter.name(), batch.id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(ExportReport {
                batch_id: batch.id,
                attempts,
                payload_len,
                elapsed: started.elapsed(),
            }),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.lifecycle.flush().await;
        let results = join_all(self.exporters.iter().map(|e| e.flush())).await;
        results.into_iter().collect()
    }

    async fn shutdown(&self, timeout: Duration) -> Result<ShutdownStatus> {
        let Some(own) = self.lifecycle.begin_shutdown(timeout).await else {
            return Ok(ShutdownStatus::AlreadyShutDown);
        };

        let results = join_all(self.exporters.iter().map(|e| e.shutdown(timeout))).await;
        self.lifecycle.terminate();

        let mut timed_out = own == ShutdownStatus::TimedOut;
        for result in results {
            timed_out |= result? == ShutdownStatus::TimedOut;
        }

        if timed_out {
            Ok(ShutdownStatus::TimedOut)
        } else {
            Ok(ShutdownStatus::Drained)
        }
    }
}
