//! Protobuf wire encoding of telemetry batches
//!
//! Every message describes its fields once, through [`ProtoMessage::visit`]. Marshaling walks
//! that description twice: a sizing pass that computes lengths leaf-to-root and records each
//! nested message length in pre-order, then a writing pass that consumes those lengths in the
//! same order into a buffer allocated once at the final size.

use crate::errors::{ExporterError, Result};
use crate::telemetry::{
    AnyValue, InstrumentationScope, KeyValue, LogRecord, MetricData, MetricPoint, NumberValue,
    Resource, Signal, SpanRecord, SpanStatus, StatusCode, TelemetryBatch, TelemetryRecord,
};
use bytes::Bytes;
use std::io::Write;
use std::marker::PhantomData;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

pub trait WireKind {
    const WIRE_TYPE: WireType;
}

#[derive(Clone, Copy, Debug)]
pub struct Varint;
#[derive(Clone, Copy, Debug)]
pub struct Fixed64;
#[derive(Clone, Copy, Debug)]
pub struct Fixed32;
#[derive(Clone, Copy, Debug)]
pub struct LengthDelimited;

impl WireKind for Varint {
    const WIRE_TYPE: WireType = WireType::Varint;
}
impl WireKind for Fixed64 {
    const WIRE_TYPE: WireType = WireType::Fixed64;
}
impl WireKind for Fixed32 {
    const WIRE_TYPE: WireType = WireType::Fixed32;
}
impl WireKind for LengthDelimited {
    const WIRE_TYPE: WireType = WireType::LengthDelimited;
}

/// A field number bound to its wire type. Writing a value through a field of the wrong
/// wire type does not compile.
#[derive(Clone, Copy, Debug)]
pub struct Field<W: WireKind> {
    number: u32,
    _wire: PhantomData<W>,
}

impl<W: WireKind> Field<W> {
    pub const fn new(number: u32) -> Self {
        Self {
            number,
            _wire: PhantomData,
        }
    }

    pub const fn number(&self) -> u32 {
        self.number
    }

    pub const fn tag(&self) -> u64 {
        ((self.number as u64) << 3) | W::WIRE_TYPE as u64
    }

    pub const fn tag_size(&self) -> usize {
        varint_size(self.tag())
    }
}

/// Bytes needed for `value` in base-128 encoding.
pub const fn varint_size(value: u64) -> usize {
    let mut value = value;
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

// Field tables. Resource and scope grouping messages share numbering across the three
// signals, so one table serves ResourceSpans, ResourceLogs and ResourceMetrics alike.
mod fields {
    use super::{Field, Fixed32, Fixed64, LengthDelimited, Varint};

    pub mod request {
        use super::*;
        pub const RESOURCE_GROUPS: Field<LengthDelimited> = Field::new(1);
    }

    pub mod resource_group {
        use super::*;
        pub const RESOURCE: Field<LengthDelimited> = Field::new(1);
        pub const SCOPE_GROUPS: Field<LengthDelimited> = Field::new(2);
    }

    pub mod scope_group {
        use super::*;
        pub const SCOPE: Field<LengthDelimited> = Field::new(1);
        pub const RECORDS: Field<LengthDelimited> = Field::new(2);
    }

    pub mod resource {
        use super::*;
        pub const ATTRIBUTES: Field<LengthDelimited> = Field::new(1);
    }

    pub mod scope {
        use super::*;
        pub const NAME: Field<LengthDelimited> = Field::new(1);
        pub const VERSION: Field<LengthDelimited> = Field::new(2);
    }

    pub mod key_value {
        use super::*;
        pub const KEY: Field<LengthDelimited> = Field::new(1);
        pub const VALUE: Field<LengthDelimited> = Field::new(2);
    }

    pub mod any_value {
        use super::*;
        pub const STRING: Field<LengthDelimited> = Field::new(1);
        pub const BOOL: Field<Varint> = Field::new(2);
        pub const INT: Field<Varint> = Field::new(3);
        pub const DOUBLE: Field<Fixed64> = Field::new(4);
    }

    pub mod span {
        use super::*;
        pub const TRACE_ID: Field<LengthDelimited> = Field::new(1);
        pub const SPAN_ID: Field<LengthDelimited> = Field::new(2);
        pub const PARENT_SPAN_ID: Field<LengthDelimited> = Field::new(4);
        pub const NAME: Field<LengthDelimited> = Field::new(5);
        pub const KIND: Field<Varint> = Field::new(6);
        pub const START_TIME: Field<Fixed64> = Field::new(7);
        pub const END_TIME: Field<Fixed64> = Field::new(8);
        pub const ATTRIBUTES: Field<LengthDelimited> = Field::new(9);
        pub const STATUS: Field<LengthDelimited> = Field::new(15);
    }

    pub mod status {
        use super::*;
        pub const MESSAGE: Field<LengthDelimited> = Field::new(2);
        pub const CODE: Field<Varint> = Field::new(3);
    }

    pub mod log_record {
        use super::*;
        pub const TIME: Field<Fixed64> = Field::new(1);
        pub const SEVERITY_NUMBER: Field<Varint> = Field::new(2);
        pub const SEVERITY_TEXT: Field<LengthDelimited> = Field::new(3);
        pub const BODY: Field<LengthDelimited> = Field::new(5);
        pub const ATTRIBUTES: Field<LengthDelimited> = Field::new(6);
        pub const FLAGS: Field<Fixed32> = Field::new(8);
        pub const TRACE_ID: Field<LengthDelimited> = Field::new(9);
        pub const SPAN_ID: Field<LengthDelimited> = Field::new(10);
        pub const OBSERVED_TIME: Field<Fixed64> = Field::new(11);
    }

    pub mod metric {
        use super::*;
        pub const NAME: Field<LengthDelimited> = Field::new(1);
        pub const DESCRIPTION: Field<LengthDelimited> = Field::new(2);
        pub const UNIT: Field<LengthDelimited> = Field::new(3);
        pub const GAUGE: Field<LengthDelimited> = Field::new(5);
        pub const SUM: Field<LengthDelimited> = Field::new(7);
    }

    pub mod gauge {
        use super::*;
        pub const DATA_POINTS: Field<LengthDelimited> = Field::new(1);
    }

    pub mod sum {
        use super::*;
        pub const DATA_POINTS: Field<LengthDelimited> = Field::new(1);
        pub const TEMPORALITY: Field<Varint> = Field::new(2);
        pub const IS_MONOTONIC: Field<Varint> = Field::new(3);
    }

    pub mod number_point {
        use super::*;
        pub const START_TIME: Field<Fixed64> = Field::new(2);
        pub const TIME: Field<Fixed64> = Field::new(3);
        pub const AS_DOUBLE: Field<Fixed64> = Field::new(4);
        pub const AS_INT: Field<Fixed64> = Field::new(6);
        pub const ATTRIBUTES: Field<LengthDelimited> = Field::new(7);
    }
}

/// Receives the fields of a message in emission order.
pub(crate) trait FieldVisitor: Sized {
    fn varint(&mut self, field: Field<Varint>, value: u64);
    fn fixed64(&mut self, field: Field<Fixed64>, value: u64);
    fn fixed32(&mut self, field: Field<Fixed32>, value: u32);
    fn bytes(&mut self, field: Field<LengthDelimited>, value: &[u8]);
    fn message<M: ProtoMessage>(&mut self, field: Field<LengthDelimited>, message: &M) -> Result<()>;

    fn string(&mut self, field: Field<LengthDelimited>, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    fn double(&mut self, field: Field<Fixed64>, value: f64) {
        self.fixed64(field, value.to_bits());
    }
}

pub(crate) trait ProtoMessage {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()>;
}

/// Nested message lengths in the order the writer will need them.
#[derive(Debug, Default)]
struct SizeTable {
    sizes: Vec<usize>,
}

impl SizeTable {
    fn reserve(&mut self) -> usize {
        self.sizes.push(0);
        self.sizes.len() - 1
    }

    fn set(&mut self, slot: usize, size: usize) {
        self.sizes[slot] = size;
    }
}

#[derive(Debug, Default)]
struct SizeVisitor {
    total: usize,
    table: SizeTable,
}

impl FieldVisitor for SizeVisitor {
    fn varint(&mut self, field: Field<Varint>, value: u64) {
        self.total += field.tag_size() + varint_size(value);
    }

    fn fixed64(&mut self, field: Field<Fixed64>, _value: u64) {
        self.total += field.tag_size() + 8;
    }

    fn fixed32(&mut self, field: Field<Fixed32>, _value: u32) {
        self.total += field.tag_size() + 4;
    }

    fn bytes(&mut self, field: Field<LengthDelimited>, value: &[u8]) {
        self.total += field.tag_size() + varint_size(value.len() as u64) + value.len();
    }

    fn message<M: ProtoMessage>(&mut self, field: Field<LengthDelimited>, message: &M) -> Result<()> {
        let slot = self.table.reserve();
        let outer = std::mem::take(&mut self.total);
        message.visit(self)?;
        let body = self.total;
        self.table.set(slot, body);
        self.total = outer + field.tag_size() + varint_size(body as u64) + body;
        Ok(())
    }
}

struct WriteVisitor<'a> {
    buf: Vec<u8>,
    sizes: &'a [usize],
    cursor: usize,
}

impl WriteVisitor<'_> {
    fn tag<W: WireKind>(&mut self, field: Field<W>) {
        encode_varint(field.tag(), &mut self.buf);
    }
}

impl FieldVisitor for WriteVisitor<'_> {
    fn varint(&mut self, field: Field<Varint>, value: u64) {
        self.tag(field);
        encode_varint(value, &mut self.buf);
    }

    fn fixed64(&mut self, field: Field<Fixed64>, value: u64) {
        self.tag(field);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn fixed32(&mut self, field: Field<Fixed32>, value: u32) {
        self.tag(field);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, field: Field<LengthDelimited>, value: &[u8]) {
        self.tag(field);
        encode_varint(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(value);
    }

    fn message<M: ProtoMessage>(&mut self, field: Field<LengthDelimited>, message: &M) -> Result<()> {
        let expected = *self.sizes.get(self.cursor).ok_or_else(|| {
            ExporterError::Marshal("size table exhausted before write completed".to_string())
        })?;
        self.cursor += 1;

        self.tag(field);
        encode_varint(expected as u64, &mut self.buf);
        let start = self.buf.len();
        message.visit(self)?;

        let written = self.buf.len() - start;
        if written != expected {
            return Err(ExporterError::Marshal(format!(
                "field {} wrote {} bytes but was sized at {}",
                field.number(),
                written,
                expected
            )));
        }
        Ok(())
    }
}

/// Sizes then writes `message`, returning a buffer whose length equals the sized length.
pub(crate) fn encode<M: ProtoMessage>(message: &M) -> Result<Vec<u8>> {
    let mut sizer = SizeVisitor::default();
    message.visit(&mut sizer)?;
    let total = sizer.total;

    let mut writer = WriteVisitor {
        buf: Vec::with_capacity(total),
        sizes: &sizer.table.sizes,
        cursor: 0,
    };
    message.visit(&mut writer)?;

    if writer.buf.len() != total || writer.cursor != writer.sizes.len() {
        return Err(ExporterError::Marshal(format!(
            "wrote {} bytes but payload was sized at {}",
            writer.buf.len(),
            total
        )));
    }
    Ok(writer.buf)
}

/// Encoded bytes of one batch, shared by every attempt that sends it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarshaledPayload {
    bytes: Bytes,
}

impl MarshaledPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reference-counted handle on the encoded bytes; cloning does not copy them.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl From<Vec<u8>> for MarshaledPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// Stateless encoder from [`TelemetryBatch`] to an OTLP export request.
#[derive(Clone, Copy, Debug, Default)]
pub struct Marshaler;

impl Marshaler {
    /// Exact number of bytes [`Marshaler::write`] will produce for `batch`.
    pub fn size(batch: &TelemetryBatch) -> Result<usize> {
        let mut sizer = SizeVisitor::default();
        ExportRequest(batch).visit(&mut sizer)?;
        Ok(sizer.total)
    }

    pub fn marshal(batch: &TelemetryBatch) -> Result<MarshaledPayload> {
        encode(&ExportRequest(batch)).map(MarshaledPayload::from)
    }

    /// Writes the encoded batch to `sink`, returning the byte count.
    pub fn write<W: Write>(batch: &TelemetryBatch, sink: &mut W) -> Result<usize> {
        let payload = encode(&ExportRequest(batch))?;
        sink.write_all(&payload)?;
        Ok(payload.len())
    }
}

struct ExportRequest<'a>(&'a TelemetryBatch);
struct ResourceGroup<'a>(&'a TelemetryBatch);
struct ScopeGroup<'a>(&'a TelemetryBatch);

impl ProtoMessage for ExportRequest<'_> {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        // An empty batch is an export request with no resource groups.
        if self.0.is_empty() {
            return Ok(());
        }
        visitor.message(fields::request::RESOURCE_GROUPS, &ResourceGroup(self.0))
    }
}

impl ProtoMessage for ResourceGroup<'_> {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        visitor.message(fields::resource_group::RESOURCE, &self.0.resource)?;
        visitor.message(fields::resource_group::SCOPE_GROUPS, &ScopeGroup(self.0))
    }
}

impl ProtoMessage for ScopeGroup<'_> {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        let batch = self.0;
        visitor.message(fields::scope_group::SCOPE, &batch.scope)?;

        for (index, record) in batch.records.iter().enumerate() {
            match (batch.signal, record) {
                (Signal::Traces, TelemetryRecord::Span(span)) => {
                    visitor.message(fields::scope_group::RECORDS, span)?
                }
                (Signal::Logs, TelemetryRecord::Log(log)) => {
                    visitor.message(fields::scope_group::RECORDS, log)?
                }
                (Signal::Metrics, TelemetryRecord::Metric(point)) => {
                    visitor.message(fields::scope_group::RECORDS, point)?
                }
                (signal, record) => {
                    return Err(ExporterError::Marshal(format!(
                        "record {} of batch {} is a {} record in a {} batch",
                        index,
                        batch.id,
                        record.signal(),
                        signal
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ProtoMessage for Resource {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        for attribute in &self.attributes {
            visitor.message(fields::resource::ATTRIBUTES, attribute)?;
        }
        Ok(())
    }
}

impl ProtoMessage for InstrumentationScope {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        if !self.name.is_empty() {
            visitor.string(fields::scope::NAME, &self.name);
        }
        if let Some(version) = self.version.as_deref().filter(|v| !v.is_empty()) {
            visitor.string(fields::scope::VERSION, version);
        }
        Ok(())
    }
}

impl ProtoMessage for KeyValue {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        if !self.key.is_empty() {
            visitor.string(fields::key_value::KEY, &self.key);
        }
        visitor.message(fields::key_value::VALUE, &self.value)
    }
}

impl ProtoMessage for AnyValue {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        // oneof members are always present, even at their default value
        match self {
            AnyValue::String(value) => visitor.string(fields::any_value::STRING, value),
            AnyValue::Bool(value) => visitor.varint(fields::any_value::BOOL, *value as u64),
            AnyValue::Int(value) => visitor.varint(fields::any_value::INT, *value as u64),
            AnyValue::Double(value) => visitor.double(fields::any_value::DOUBLE, *value),
        }
        Ok(())
    }
}

fn check_id(kind: &str, id: &[u8], expected: usize) -> Result<()> {
    if id.len() != expected {
        return Err(ExporterError::Marshal(format!(
            "{} must be {} bytes, got {}",
            kind,
            expected,
            id.len()
        )));
    }
    Ok(())
}

impl ProtoMessage for SpanRecord {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        use fields::span::*;

        check_id("trace id", &self.trace_id, 16)?;
        check_id("span id", &self.span_id, 8)?;
        visitor.bytes(TRACE_ID, &self.trace_id);
        visitor.bytes(SPAN_ID, &self.span_id);
        if let Some(parent) = &self.parent_span_id {
            check_id("parent span id", parent, 8)?;
            visitor.bytes(PARENT_SPAN_ID, parent);
        }
        if !self.name.is_empty() {
            visitor.string(NAME, &self.name);
        }
        if self.kind as u64 != 0 {
            visitor.varint(KIND, self.kind as u64);
        }
        if self.start_time_unix_nano != 0 {
            visitor.fixed64(START_TIME, self.start_time_unix_nano);
        }
        if self.end_time_unix_nano != 0 {
            visitor.fixed64(END_TIME, self.end_time_unix_nano);
        }
        for attribute in &self.attributes {
            visitor.message(ATTRIBUTES, attribute)?;
        }
        if self.status != SpanStatus::default() {
            visitor.message(STATUS, &self.status)?;
        }
        Ok(())
    }
}

impl ProtoMessage for SpanStatus {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        if !self.message.is_empty() {
            visitor.string(fields::status::MESSAGE, &self.message);
        }
        if self.code != StatusCode::Unset {
            visitor.varint(fields::status::CODE, self.code as u64);
        }
        Ok(())
    }
}

impl ProtoMessage for LogRecord {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        use fields::log_record::*;

        if self.time_unix_nano != 0 {
            visitor.fixed64(TIME, self.time_unix_nano);
        }
        if self.severity as u64 != 0 {
            visitor.varint(SEVERITY_NUMBER, self.severity as u64);
        }
        if !self.severity_text.is_empty() {
            visitor.string(SEVERITY_TEXT, &self.severity_text);
        }
        if let Some(body) = &self.body {
            visitor.message(BODY, body)?;
        }
        for attribute in &self.attributes {
            visitor.message(ATTRIBUTES, attribute)?;
        }
        if self.flags != 0 {
            visitor.fixed32(FLAGS, self.flags);
        }
        if let Some(trace_id) = &self.trace_id {
            check_id("trace id", trace_id, 16)?;
            visitor.bytes(TRACE_ID, trace_id);
        }
        if let Some(span_id) = &self.span_id {
            check_id("span id", span_id, 8)?;
            visitor.bytes(SPAN_ID, span_id);
        }
        if self.observed_time_unix_nano != 0 {
            visitor.fixed64(OBSERVED_TIME, self.observed_time_unix_nano);
        }
        Ok(())
    }
}

struct GaugeBody<'a>(&'a MetricPoint);
struct SumBody<'a>(&'a MetricPoint);
struct NumberPoint<'a>(&'a MetricPoint);

impl ProtoMessage for MetricPoint {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        use fields::metric::*;

        if !self.name.is_empty() {
            visitor.string(NAME, &self.name);
        }
        if !self.description.is_empty() {
            visitor.string(DESCRIPTION, &self.description);
        }
        if !self.unit.is_empty() {
            visitor.string(UNIT, &self.unit);
        }
        match self.data {
            MetricData::Gauge => visitor.message(GAUGE, &GaugeBody(self)),
            MetricData::Sum { .. } => visitor.message(SUM, &SumBody(self)),
        }
    }
}

impl ProtoMessage for GaugeBody<'_> {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        visitor.message(fields::gauge::DATA_POINTS, &NumberPoint(self.0))
    }
}

impl ProtoMessage for SumBody<'_> {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        visitor.message(fields::sum::DATA_POINTS, &NumberPoint(self.0))?;
        if let MetricData::Sum { monotonic, temporality } = self.0.data {
            visitor.varint(fields::sum::TEMPORALITY, temporality as u64);
            if monotonic {
                visitor.varint(fields::sum::IS_MONOTONIC, 1);
            }
        }
        Ok(())
    }
}

impl ProtoMessage for NumberPoint<'_> {
    fn visit<V: FieldVisitor>(&self, visitor: &mut V) -> Result<()> {
        use fields::number_point::*;

        let point = self.0;
        if point.start_time_unix_nano != 0 {
            visitor.fixed64(START_TIME, point.start_time_unix_nano);
        }
        if point.time_unix_nano != 0 {
            visitor.fixed64(TIME, point.time_unix_nano);
        }
        match point.value {
            NumberValue::Double(value) => visitor.double(AS_DOUBLE, value),
            NumberValue::Int(value) => visitor.fixed64(AS_INT, value as u64),
        }
        for attribute in &point.attributes {
            visitor.message(ATTRIBUTES, attribute)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Severity, SpanKind};

    fn read_varint(bytes: &[u8]) -> (u64, usize) {
        let mut value = 0u64;
        for (i, byte) in bytes.iter().enumerate() {
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return (value, i + 1);
            }
        }
        panic!("truncated varint");
    }

    fn span_batch(count: usize) -> TelemetryBatch {
        TelemetryBatch::new(
            Signal::Traces,
            Resource::with_service_name("checkout"),
            InstrumentationScope::new("checkout.http").with_version("1.0.0"),
        )
        .with_records((0..count).map(|i| {
            SpanRecord::new([7; 16], [i as u8 + 1; 8], format!("span-{}", i))
                .with_kind(SpanKind::Server)
                .with_attribute(KeyValue::new("http.route", "/cart"))
                .with_attribute(KeyValue::new("retry", i as i64 - 1))
                .with_status(StatusCode::Error, "boom")
        }))
    }

    #[test]
    fn test_varint_encoding() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xac, 0x02]);
        assert_eq!(varint_size(300), 2);
        assert_eq!(varint_size(0), 1);
        assert_eq!(varint_size(127), 1);
        assert_eq!(varint_size(128), 2);
        assert_eq!(varint_size(u64::MAX), 10);
    }

    #[test]
    fn test_field_tags() {
        assert_eq!(fields::span::STATUS.tag(), (15 << 3) | 2);
        assert_eq!(fields::span::START_TIME.tag(), (7 << 3) | 1);
        assert_eq!(fields::log_record::FLAGS.tag(), (8 << 3) | 5);
        assert_eq!(fields::span::STATUS.tag_size(), 1);
        assert_eq!(Field::<Varint>::new(16).tag_size(), 2);
    }

    #[test]
    fn test_key_value_bytes() {
        let bytes = encode(&KeyValue::new("a", true)).unwrap();
        assert_eq!(bytes, vec![0x0a, 0x01, b'a', 0x12, 0x02, 0x10, 0x01]);

        // negative int64 takes the full ten bytes
        let bytes = encode(&AnyValue::Int(-1)).unwrap();
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[0], 0x18);
    }

    #[test]
    fn test_size_matches_written_length() {
        let batches = vec![
            span_batch(1),
            span_batch(3),
            span_batch(200),
            TelemetryBatch::new(Signal::Logs, Resource::default(), InstrumentationScope::default())
                .with_record(
                    LogRecord::new(Severity::Warn, "x".repeat(300))
                        .with_trace_context([1; 16], [2; 8])
                        .with_attribute(KeyValue::new("ratio", 2.5)),
                ),
            TelemetryBatch::new(Signal::Metrics, Resource::with_service_name("svc"), InstrumentationScope::new("m"))
                .with_record(MetricPoint::gauge("queue.depth", NumberValue::Int(-4)).with_unit("1"))
                .with_record(MetricPoint::sum("requests", NumberValue::Double(0.0), true)),
        ];

        for batch in &batches {
            let size = Marshaler::size(batch).unwrap();
            let payload = Marshaler::marshal(batch).unwrap();
            assert_eq!(payload.len(), size, "batch of {} records", batch.len());
        }
    }

    #[test]
    fn test_request_is_length_delimited_resource_group() {
        let payload = Marshaler::marshal(&span_batch(3)).unwrap();
        let bytes = payload.as_bytes();

        assert_eq!(bytes[0], 0x0a);
        let (len, consumed) = read_varint(&bytes[1..]);
        assert_eq!(len as usize, bytes.len() - 1 - consumed);
    }

    #[test]
    fn test_empty_batch_marshals_to_empty_payload() {
        let batch = TelemetryBatch::new(Signal::Traces, Resource::default(), InstrumentationScope::default());

        assert_eq!(Marshaler::size(&batch).unwrap(), 0);
        let payload = Marshaler::marshal(&batch).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_marshal_is_deterministic() {
        let batch = span_batch(5);
        assert_eq!(
            Marshaler::marshal(&batch).unwrap(),
            Marshaler::marshal(&batch).unwrap()
        );
    }

    #[test]
    fn test_payload_handles_share_one_buffer() {
        let payload = Marshaler::marshal(&span_batch(2)).unwrap();
        let first = payload.bytes();
        let second = payload.clone().bytes();

        assert_eq!(first.as_ptr(), payload.as_bytes().as_ptr());
        assert_eq!(second.as_ptr(), payload.as_bytes().as_ptr());
        assert_eq!(first.len(), payload.len());
    }

    #[test]
    fn test_write_to_sink() {
        let batch = span_batch(2);
        let mut sink = Vec::new();

        let written = Marshaler::write(&batch, &mut sink).unwrap();
        assert_eq!(written, sink.len());
        assert_eq!(written, Marshaler::size(&batch).unwrap());
    }

    #[test]
    fn test_record_of_wrong_signal_is_a_fault() {
        let batch = span_batch(1).with_record(LogRecord::new(Severity::Info, "stray"));

        let err = Marshaler::marshal(&batch).unwrap_err();
        assert!(matches!(err, ExporterError::Marshal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_trace_id_is_a_fault() {
        let mut span = SpanRecord::new([1; 16], [2; 8], "bad");
        span.trace_id.truncate(4);
        let batch = TelemetryBatch::new(Signal::Traces, Resource::default(), InstrumentationScope::default())
            .with_record(span);

        assert!(matches!(Marshaler::size(&batch), Err(ExporterError::Marshal(_))));
    }
}
