//! Telemetry data structures handed to the export pipeline

use crate::errors::{ExporterError, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Install the JSON log subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .map_err(|e| ExporterError::Config(format!("invalid log filter {}: {}", log_level, e)))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ExporterError::Config(format!("tracing already initialized: {}", e)))
}

/// The three telemetry signals, each with its own exporter set and wire request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Traces, Signal::Metrics, Signal::Logs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
        }
    }

    /// Property naming the exporters for this signal, e.g. `otel.traces.exporter`
    pub fn exporter_key(&self) -> String {
        format!("otel.{}.exporter", self.as_str())
    }

    /// OTLP/HTTP request path
    pub fn http_path(&self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnyValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::String(value.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        AnyValue::String(value)
    }
}

impl From<bool> for AnyValue {
    fn from(value: bool) -> Self {
        AnyValue::Bool(value)
    }
}

impl From<i64> for AnyValue {
    fn from(value: i64) -> Self {
        AnyValue::Int(value)
    }
}

impl From<f64> for AnyValue {
    fn from(value: f64) -> Self {
        AnyValue::Double(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

impl Resource {
    pub fn new(attributes: Vec<KeyValue>) -> Self {
        Self { attributes }
    }

    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self::new(vec![KeyValue::new("service.name", service_name.into())])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum SpanKind {
    #[default]
    Unspecified = 0,
    Internal = 1,
    Server = 2,
    Client = 3,
    Producer = 4,
    Consumer = 5,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum StatusCode {
    #[default]
    Unset = 0,
    Ok = 1,
    Error = 2,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpanRecord {
    #[serde(serialize_with = "serialize_hex")]
    pub trace_id: Vec<u8>,
    #[serde(serialize_with = "serialize_hex")]
    pub span_id: Vec<u8>,
    #[serde(serialize_with = "serialize_opt_hex")]
    pub parent_span_id: Option<Vec<u8>>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: Vec<KeyValue>,
    pub status: SpanStatus,
}

impl SpanRecord {
    pub fn new(trace_id: [u8; 16], span_id: [u8; 8], name: impl Into<String>) -> Self {
        let now = now_unix_nanos();
        Self {
            trace_id: trace_id.to_vec(),
            span_id: span_id.to_vec(),
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time_unix_nano: now,
            end_time_unix_nano: now,
            attributes: Vec::new(),
            status: SpanStatus::default(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: [u8; 8]) -> Self {
        self.parent_span_id = Some(parent_span_id.to_vec());
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_status(mut self, code: StatusCode, message: impl Into<String>) -> Self {
        self.status = SpanStatus {
            code,
            message: message.into(),
        };
        self
    }

    pub fn with_timestamps(mut self, start_unix_nano: u64, end_unix_nano: u64) -> Self {
        self.start_time_unix_nano = start_unix_nano;
        self.end_time_unix_nano = end_unix_nano;
        self
    }
}

/// Log severity, valued with the OTLP severity number of each level's first slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Severity {
    #[default]
    Unspecified = 0,
    Trace = 1,
    Debug = 5,
    Info = 9,
    Warn = 13,
    Error = 17,
    Fatal = 21,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Unspecified => write!(f, "UNSPECIFIED"),
            Severity::Trace => write!(f, "TRACE"),
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => Severity::Trace,
            "DEBUG" => Severity::Debug,
            "INFO" | "INFORMATION" => Severity::Info,
            "WARN" | "WARNING" => Severity::Warn,
            "ERROR" | "ERR" => Severity::Error,
            "FATAL" | "CRITICAL" => Severity::Fatal,
            _ => Severity::Unspecified,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogRecord {
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity: Severity,
    pub severity_text: String,
    pub body: Option<AnyValue>,
    pub attributes: Vec<KeyValue>,
    pub flags: u32,
    #[serde(serialize_with = "serialize_opt_hex")]
    pub trace_id: Option<Vec<u8>>,
    #[serde(serialize_with = "serialize_opt_hex")]
    pub span_id: Option<Vec<u8>>,
}

impl LogRecord {
    pub fn new(severity: Severity, body: impl Into<AnyValue>) -> Self {
        let now = now_unix_nanos();
        Self {
            time_unix_nano: now,
            observed_time_unix_nano: now,
            severity,
            severity_text: severity.to_string(),
            body: Some(body.into()),
            attributes: Vec::new(),
            flags: 0,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_trace_context(mut self, trace_id: [u8; 16], span_id: [u8; 8]) -> Self {
        self.trace_id = Some(trace_id.to_vec());
        self.span_id = Some(span_id.to_vec());
        self
    }

    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Temporality {
    Delta = 1,
    Cumulative = 2,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum MetricData {
    Gauge,
    Sum { monotonic: bool, temporality: Temporality },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NumberValue {
    Int(i64),
    Double(f64),
}

/// A single data point of a gauge or sum metric.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub data: MetricData,
    pub value: NumberValue,
    pub attributes: Vec<KeyValue>,
    pub start_time_unix_nano: u64,
    pub time_unix_nano: u64,
}

impl MetricPoint {
    pub fn gauge(name: impl Into<String>, value: NumberValue) -> Self {
        let now = now_unix_nanos();
        Self {
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            data: MetricData::Gauge,
            value,
            attributes: Vec::new(),
            start_time_unix_nano: now,
            time_unix_nano: now,
        }
    }

    pub fn sum(name: impl Into<String>, value: NumberValue, monotonic: bool) -> Self {
        Self {
            data: MetricData::Sum {
                monotonic,
                temporality: Temporality::Cumulative,
            },
            ..Self::gauge(name, value)
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryRecord {
    Span(SpanRecord),
    Log(LogRecord),
    Metric(MetricPoint),
}

impl TelemetryRecord {
    pub fn signal(&self) -> Signal {
        match self {
            TelemetryRecord::Span(_) => Signal::Traces,
            TelemetryRecord::Log(_) => Signal::Logs,
            TelemetryRecord::Metric(_) => Signal::Metrics,
        }
    }
}

impl From<SpanRecord> for TelemetryRecord {
    fn from(span: SpanRecord) -> Self {
        TelemetryRecord::Span(span)
    }
}

impl From<LogRecord> for TelemetryRecord {
    fn from(log: LogRecord) -> Self {
        TelemetryRecord::Log(log)
    }
}

impl From<MetricPoint> for TelemetryRecord {
    fn from(point: MetricPoint) -> Self {
        TelemetryRecord::Metric(point)
    }
}

/// Ordered records of one signal sharing a resource and instrumentation scope.
#[derive(Clone, Debug, Serialize)]
pub struct TelemetryBatch {
    pub id: Uuid,
    pub signal: Signal,
    pub resource: Resource,
    pub scope: InstrumentationScope,
    pub records: Vec<TelemetryRecord>,
}

impl TelemetryBatch {
    pub fn new(signal: Signal, resource: Resource, scope: InstrumentationScope) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal,
            resource,
            scope,
            records: Vec::new(),
        }
    }

    pub fn with_record(mut self, record: impl Into<TelemetryRecord>) -> Self {
        self.records.push(record.into());
        self
    }

    pub fn with_records<I, R>(mut self, records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<TelemetryRecord>,
    {
        self.records.extend(records.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn now_unix_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|nanos| nanos.max(0) as u64)
        .unwrap_or_default()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_hex(bytes))
}

fn serialize_opt_hex<S: Serializer>(
    bytes: &Option<Vec<u8>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_some(&to_hex(bytes)),
        None => serializer.serialize_none(),
    }
}
