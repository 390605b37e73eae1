//! Parsing and rendering of the `ot` tracestate entry.
//!
//! Samplers cooperating on consistent probability sampling exchange two
//! sub-fields inside the OpenTelemetry vendor entry of the W3C tracestate
//! header: `p`, the threshold exponent used by the most recent sampled
//! decision, and `r`, the per-trace randomness value. The entry value has the
//! shape `p:<exponent>;r:<randomness>`; either sub-field may be absent, and
//! unrecognized sub-fields pass through untouched. Sibling vendor entries in
//! the same header are carried by [`TraceState`] itself and are never
//! modified here.

use opentelemetry::trace::{TraceId, TraceState};

/// Tracestate key reserved for the OpenTelemetry sampling sub-fields.
const OT_VENDOR_KEY: &str = "ot";

/// Entry values longer than the W3C tracestate limit are ignored wholesale.
const MAX_VALUE_LENGTH: usize = 256;

/// Largest randomness value a trace can carry.
///
/// An `r` outside `[0, MAX_RANDOMNESS_VALUE]` signals a malformed or
/// non-participating upstream and must be repaired before use.
pub const MAX_RANDOMNESS_VALUE: u8 = 62;

/// Largest threshold exponent a sampled decision can record. A decision made
/// with exponent 63 keeps nothing, so a propagated `p` above this is invalid.
pub const MAX_EXPONENT: u8 = 63;

/// The sampling sub-fields of the `ot` tracestate entry.
///
/// Parsing is total: malformed or out-of-type sub-fields read as absent, per
/// the self-healing contract of consistent sampling. Values are range-checked
/// at the point of use, not here, so that diagnostics can report what was
/// actually received.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OtTraceState {
    /// Threshold exponent recorded by the most recent sampled decision in
    /// this trace's ancestry, absent if that decision was a drop.
    pub p: Option<u8>,
    /// Per-trace randomness value, fixed at the root and propagated
    /// unchanged.
    pub r: Option<u8>,
    /// Unrecognized sub-fields, preserved verbatim and in order.
    rest: Option<String>,
}

impl OtTraceState {
    /// Read the sampling sub-fields out of `trace_state`.
    pub fn parse(trace_state: &TraceState) -> Self {
        let value = match trace_state.get(OT_VENDOR_KEY) {
            Some(value) if value.len() <= MAX_VALUE_LENGTH => value,
            _ => return OtTraceState::default(),
        };

        let mut parsed = OtTraceState::default();
        let mut rest = String::new();
        for field in value.split(';') {
            let (key, sub_value) = match field.split_once(':') {
                Some((key, sub_value)) => (key, Some(sub_value)),
                None => (field, None),
            };
            match key {
                "p" => parsed.p = sub_value.and_then(decimal),
                "r" => parsed.r = sub_value.and_then(decimal),
                _ => {
                    if !rest.is_empty() {
                        rest.push(';');
                    }
                    rest.push_str(field);
                }
            }
        }
        if !rest.is_empty() {
            parsed.rest = Some(rest);
        }
        parsed
    }

    /// Build a new [`TraceState`] carrying `p` and `r` in place of the parsed
    /// sub-fields, keeping this entry's unrecognized sub-fields and all
    /// sibling vendor entries of `trace_state` intact.
    ///
    /// `trace_state` must be the value this instance was parsed from; it is
    /// never mutated. When nothing remains to carry, the `ot` entry is
    /// removed entirely.
    pub fn update(&self, trace_state: &TraceState, p: Option<u8>, r: Option<u8>) -> TraceState {
        let mut fields = Vec::with_capacity(3);
        if let Some(p) = p {
            fields.push(format!("p:{p}"));
        }
        if let Some(r) = r {
            fields.push(format!("r:{r}"));
        }
        if let Some(rest) = &self.rest {
            fields.push(rest.clone());
        }

        if fields.is_empty() {
            if trace_state.get(OT_VENDOR_KEY).is_some() {
                trace_state
                    .delete(OT_VENDOR_KEY)
                    .unwrap_or_else(|_| trace_state.clone())
            } else {
                trace_state.clone()
            }
        } else {
            trace_state
                .insert(OT_VENDOR_KEY, fields.join(";"))
                .unwrap_or_else(|_| trace_state.clone())
        }
    }
}

fn decimal(value: &str) -> Option<u8> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Derive the per-trace randomness value from a trace id.
///
/// The low eight bytes of a trace id are generated from a cryptographically
/// secure source, so their leading-zero count follows the power-of-two
/// distribution consistent sampling relies on: `r >= k` holds for a `2^-k`
/// fraction of traces. The two lowest bits are forced on to clamp the result
/// to `[0, 62]`.
///
/// Every hop of a trace derives the same value from the same id, which is
/// what lets a hop that received no usable `r` regenerate it without breaking
/// consistency with its descendants.
pub fn randomness_value(trace_id: TraceId) -> u8 {
    let bytes = trace_id.to_bytes();
    let (_, low) = bytes.split_at(8);
    let low = u64::from_be_bytes(low.try_into().unwrap());
    (low | 0x3).leading_zeros() as u8
}
