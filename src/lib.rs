//! OTLP Telemetry Export Library
//!
//! This library marshals telemetry batches into OTLP protobuf payloads, delivers them with
//! retry and backoff, and assembles per-signal exporters from `OTEL_*` configuration.

pub mod config;
pub mod errors;
pub mod exporter;
pub mod lifecycle;
pub mod marshal;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod telemetry;
pub mod transport;

pub use config::{ConfigProperties, ExporterConfig};
pub use errors::{ExporterError, Result};
pub use exporter::{ExportReport, Exporter, FanoutExporter, LoggingExporter, OtlpExporter};
pub use lifecycle::{ExporterState, ShutdownStatus};
pub use marshal::{MarshaledPayload, Marshaler};
pub use provider::{ExemplarFilterKind, Pipelines, ProviderAssembler, SignalProvider};
pub use registry::{ExporterRegistry, configure_exporters};
pub use retry::{FailureClass, FailureReason, RetryDecision, RetryPolicy};
pub use telemetry::{Signal, TelemetryBatch, TelemetryRecord, init_tracing};
pub use transport::{HttpTransport, RetryingTransport, Transport};
