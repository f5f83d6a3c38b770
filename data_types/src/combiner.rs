//! Merging of serialized trace fragments.
//!
//! The same trace id can be observed in many places: several ingester
//! replicas, a live trace plus a sealed block, or overlapping blocks that
//! compaction has not yet merged. Readers and the compactor pass an
//! [`ObjectCombiner`] wherever fragments can meet; the combiner must be
//! associative and commutative because no cross-push ordering is promised.

use crate::trace::Trace;
use snafu::Snafu;
use std::collections::HashSet;

/// Errors combining two serialized objects.
#[derive(Debug, Snafu)]
pub enum CombineError {
    #[snafu(display("object is not a valid trace: {}", source))]
    MalformedObject { source: prost::DecodeError },
}

/// Merges two serialized objects into one.
pub trait ObjectCombiner: std::fmt::Debug + Send + Sync {
    /// Combine `a` and `b`. Returns the merged bytes and whether the result
    /// differs from `a` (i.e. `b` contributed anything).
    fn combine(&self, a: &[u8], b: &[u8]) -> Result<(Vec<u8>, bool), CombineError>;
}

/// Combines serialized [`Trace`] protos, deduplicating spans by span id.
///
/// Batch structure from `a` is preserved; batches from `b` are appended
/// with already-seen spans filtered out, and emptied batches dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceCombiner;

impl ObjectCombiner for TraceCombiner {
    fn combine(&self, a: &[u8], b: &[u8]) -> Result<(Vec<u8>, bool), CombineError> {
        let mut merged = Trace::decode_from_bytes(a).map_err(|source| {
            CombineError::MalformedObject { source }
        })?;
        let other = Trace::decode_from_bytes(b).map_err(|source| {
            CombineError::MalformedObject { source }
        })?;

        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for rs in &merged.resource_spans {
            for ils in &rs.instrumentation_library_spans {
                for span in &ils.spans {
                    seen.insert(span.span_id.clone());
                }
            }
        }

        let mut changed = false;
        for mut rs in other.resource_spans {
            for ils in &mut rs.instrumentation_library_spans {
                ils.spans.retain(|span| seen.insert(span.span_id.clone()));
            }
            rs.instrumentation_library_spans
                .retain(|ils| !ils.spans.is_empty());
            if !rs.instrumentation_library_spans.is_empty() {
                merged.resource_spans.push(rs);
                changed = true;
            }
        }

        Ok((merged.encode_to_bytes(), changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{InstrumentationLibrarySpans, ResourceSpans, Span};

    fn fragment(span_ids: &[u8]) -> Vec<u8> {
        let spans = span_ids
            .iter()
            .map(|id| Span {
                trace_id: vec![1; 16],
                span_id: vec![*id; 8],
                parent_span_id: vec![],
                name: format!("span-{id}"),
                start_time_unix_nano: 1,
                end_time_unix_nano: 2,
                status_code: 0,
                attributes: vec![],
            })
            .collect();
        Trace {
            resource_spans: vec![ResourceSpans {
                resource: None,
                instrumentation_library_spans: vec![InstrumentationLibrarySpans {
                    instrumentation_library: None,
                    spans,
                }],
            }],
        }
        .encode_to_bytes()
    }

    fn span_ids(bytes: &[u8]) -> Vec<u8> {
        let trace = Trace::decode_from_bytes(bytes).unwrap();
        let mut ids: Vec<u8> = trace
            .resource_spans
            .iter()
            .flat_map(|rs| rs.instrumentation_library_spans.iter())
            .flat_map(|ils| ils.spans.iter())
            .map(|s| s.span_id[0])
            .collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn merges_disjoint_fragments() {
        let (merged, changed) = TraceCombiner
            .combine(&fragment(&[1, 2]), &fragment(&[3]))
            .unwrap();
        assert!(changed);
        assert_eq!(span_ids(&merged), vec![1, 2, 3]);
    }

    #[test]
    fn dedups_overlapping_spans() {
        let (merged, changed) = TraceCombiner
            .combine(&fragment(&[1, 2]), &fragment(&[2, 3]))
            .unwrap();
        assert!(changed);
        assert_eq!(span_ids(&merged), vec![1, 2, 3]);
    }

    #[test]
    fn identical_fragment_is_a_no_op() {
        let (merged, changed) = TraceCombiner
            .combine(&fragment(&[1, 2]), &fragment(&[1, 2]))
            .unwrap();
        assert!(!changed);
        assert_eq!(span_ids(&merged), vec![1, 2]);
    }

    #[test]
    fn commutative_up_to_span_set() {
        let ab = TraceCombiner
            .combine(&fragment(&[1]), &fragment(&[2]))
            .unwrap()
            .0;
        let ba = TraceCombiner
            .combine(&fragment(&[2]), &fragment(&[1]))
            .unwrap()
            .0;
        assert_eq!(span_ids(&ab), span_ids(&ba));
    }

    #[test]
    fn malformed_object_is_an_error() {
        let err = TraceCombiner.combine(&[0xff, 0xff, 0xff], &fragment(&[1]));
        assert!(err.is_err());
    }
}
