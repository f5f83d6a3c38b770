//! The wire-level span model.
//!
//! These message types mirror the OTLP trace shapes closely enough that a
//! receiver-side translation is mechanical. They are hand-maintained prost
//! messages; the grouping layers (`ResourceSpans`,
//! `InstrumentationLibrarySpans`) are preserved because they compress well
//! and identify origin.

use prost::Message;

/// A typed attribute value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnyValue {
    #[prost(oneof = "any_value::Value", tags = "1, 2, 3, 4")]
    pub value: ::core::option::Option<any_value::Value>,
}

/// Nested message and enum types in `AnyValue`.
pub mod any_value {
    /// The value variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(string, tag = "1")]
        StringValue(::prost::alloc::string::String),
        #[prost(bool, tag = "2")]
        BoolValue(bool),
        #[prost(int64, tag = "3")]
        IntValue(i64),
        #[prost(double, tag = "4")]
        DoubleValue(f64),
    }
}

/// A key/value attribute pair.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub value: ::core::option::Option<AnyValue>,
}

/// The emitting resource (service name, host attributes, ...).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(message, repeated, tag = "1")]
    pub attributes: ::prost::alloc::vec::Vec<KeyValue>,
}

/// Identity of the instrumentation library that produced a span batch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstrumentationLibrary {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
}

/// A single unit of work.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Span {
    #[prost(bytes = "vec", tag = "1")]
    pub trace_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub span_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub parent_span_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    #[prost(fixed64, tag = "5")]
    pub start_time_unix_nano: u64,
    #[prost(fixed64, tag = "6")]
    pub end_time_unix_nano: u64,
    #[prost(int32, tag = "7")]
    pub status_code: i32,
    #[prost(message, repeated, tag = "8")]
    pub attributes: ::prost::alloc::vec::Vec<KeyValue>,
}

/// Spans grouped by instrumentation library.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstrumentationLibrarySpans {
    #[prost(message, optional, tag = "1")]
    pub instrumentation_library: ::core::option::Option<InstrumentationLibrary>,
    #[prost(message, repeated, tag = "2")]
    pub spans: ::prost::alloc::vec::Vec<Span>,
}

/// Spans grouped by emitting resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceSpans {
    #[prost(message, optional, tag = "1")]
    pub resource: ::core::option::Option<Resource>,
    #[prost(message, repeated, tag = "2")]
    pub instrumentation_library_spans: ::prost::alloc::vec::Vec<InstrumentationLibrarySpans>,
}

/// The set of all spans sharing a trace id, as an ordered list of
/// [`ResourceSpans`] batches. Not normalized: duplicate or overlapping spans
/// may appear when emitters retry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trace {
    #[prost(message, repeated, tag = "1")]
    pub resource_spans: ::prost::alloc::vec::Vec<ResourceSpans>,
}

impl Trace {
    /// Serialize to the canonical wire form.
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Deserialize from the canonical wire form.
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }

    /// Total number of spans across all batches.
    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|rs| rs.instrumentation_library_spans.iter())
            .map(|ils| ils.spans.len())
            .sum()
    }

    /// `(min span start, max span end)` in unix nanoseconds, ignoring
    /// zeroed timestamps. `(0, 0)` for an empty trace.
    pub fn time_range(&self) -> (i64, i64) {
        let mut start = i64::MAX;
        let mut end = 0i64;
        for rs in &self.resource_spans {
            for ils in &rs.instrumentation_library_spans {
                for span in &ils.spans {
                    if span.start_time_unix_nano != 0 {
                        start = start.min(span.start_time_unix_nano as i64);
                    }
                    end = end.max(span.end_time_unix_nano as i64);
                }
            }
        }
        if start == i64::MAX {
            start = 0;
        }
        (start, end)
    }
}
