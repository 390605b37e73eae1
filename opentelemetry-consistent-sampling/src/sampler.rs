use std::cell::RefCell;
use std::env;

use opentelemetry::{
    otel_debug, otel_warn,
    trace::{
        Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    },
    Context, KeyValue,
};
use opentelemetry_sdk::trace::ShouldSample;
use rand::{rngs, Rng, SeedableRng};
use thiserror::Error;

use crate::probability::SplitProbability;
use crate::tracestate::{randomness_value, OtTraceState, MAX_EXPONENT, MAX_RANDOMNESS_VALUE};

/// The environment variable the SDK uses to carry the sampler argument.
const OTEL_TRACES_SAMPLER_ARG: &str = "OTEL_TRACES_SAMPLER_ARG";

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

/// The error returned when a sampler is configured with a probability outside
/// of `[0.0, 1.0]`.
#[derive(Debug, Error)]
#[error("sampling probability {0} is not in [0.0, 1.0]")]
pub struct InvalidProbability(f64);

/// Samples spans probabilistically, such that every service participating in
/// a trace reaches a decision consistent with the others even though each
/// decides on its own.
///
/// Each decision uses one of the two power-of-two sampling rates bracketing
/// the configured probability and compares its exponent against the trace's
/// randomness value `r`: the span is sampled when the exponent does not
/// exceed `r`. Because `r` is fixed per trace (carried in the `ot` tracestate
/// entry, or re-derived from the trace id when absent), any two samplers
/// whose exponents are ordered agree on which traces the stricter one keeps.
/// The outbound tracestate records `r`, and `p` when the span was sampled, so
/// that downstream consumers can both repeat the comparison and reconstruct
/// the effective sampling rate for reweighting.
///
/// The sampler is immutable once constructed and safe to share across
/// threads; the only per-call randomness is the choice between the two
/// bracketing exponents, drawn from a thread-local generator.
#[derive(Clone, Debug)]
pub struct ConsistentProbabilityBased {
    split: SplitProbability,
    description: String,
}

impl ConsistentProbabilityBased {
    /// Create a sampler targeting the given probability.
    ///
    /// Probabilities below `2^-62` are indistinguishable from zero for the
    /// consistency protocol and never sample.
    pub fn new(probability: f64) -> Result<Self, InvalidProbability> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(InvalidProbability(probability));
        }
        Ok(Self::with_probability(probability))
    }

    /// Create a sampler from the `OTEL_TRACES_SAMPLER_ARG` environment
    /// variable, falling back to sampling everything when the variable is
    /// missing or not a probability in `[0.0, 1.0]`.
    pub fn from_env() -> Self {
        let sampler_arg = env::var(OTEL_TRACES_SAMPLER_ARG).ok();
        let probability = sampler_arg
            .as_ref()
            .and_then(|arg| arg.parse::<f64>().ok())
            .filter(|probability| (0.0..=1.0).contains(probability));
        match probability {
            Some(probability) => Self::with_probability(probability),
            None => {
                otel_warn!(
                    name: "ConsistentProbabilityBased.InvalidSamplerArgument",
                    message = "OTEL_TRACES_SAMPLER_ARG is missing or not a probability in [0.0, 1.0]. Falling back to default: 1.0 (100% sampling)",
                    otel_traces_sampler_arg = format!("{sampler_arg:?}")
                );
                Self::with_probability(1.0)
            }
        }
    }

    fn with_probability(probability: f64) -> Self {
        let split = SplitProbability::new(probability);
        let description = if split.never_samples() {
            "ConsistentProbabilityBased{0}".to_string()
        } else {
            format!("ConsistentProbabilityBased{{{probability:.6}}}")
        };
        ConsistentProbabilityBased { split, description }
    }

    /// Sampler description, e.g. `ConsistentProbabilityBased{0.250000}`.
    pub fn description(&self) -> &str {
        &self.description
    }

    fn probabilistic_p(&self) -> u8 {
        let draw = CURRENT_RNG.with(|rng| rng.borrow_mut().random::<f64>());
        self.split.exponent(draw)
    }

    fn decide(&self, p: u8, r: u8, ot: &OtTraceState, trace_state: &TraceState) -> SamplingResult {
        if p <= r {
            SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: Vec::new(),
                trace_state: ot.update(trace_state, Some(p), Some(r)),
            }
        } else {
            SamplingResult {
                decision: SamplingDecision::Drop,
                attributes: Vec::new(),
                trace_state: ot.update(trace_state, None, Some(r)),
            }
        }
    }
}

/// Samplers with the same nominal probability are interchangeable, even when
/// their floating point internals differ.
impl PartialEq for ConsistentProbabilityBased {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description
    }
}

impl ShouldSample for ConsistentProbabilityBased {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let p = self.probabilistic_p();
        match parent_context.filter(|cx| cx.has_active_span()) {
            Some(ctx) => {
                let span = ctx.span();
                let parent_span_context = span.span_context();
                let trace_state = parent_span_context.trace_state();
                let ot = OtTraceState::parse(trace_state);
                let r = match ot.r {
                    Some(r) if r <= MAX_RANDOMNESS_VALUE => r,
                    in_r => {
                        otel_debug!(
                            name: "ConsistentProbabilityBased.PotentiallyInconsistentTrace",
                            message = "potentially inconsistent trace detected",
                            r = format!("{in_r:?}")
                        );
                        randomness_value(trace_id)
                    }
                };
                self.decide(p, r, &ot, trace_state)
            }
            None => {
                let r = randomness_value(trace_id);
                self.decide(p, r, &OtTraceState::default(), &TraceState::default())
            }
        }
    }
}

/// Respects the sampling decision made by the parent span, while keeping the
/// propagated `ot` tracestate entry consistent with that decision.
///
/// Root spans are delegated to the configured root sampler. For child spans
/// the parent's sampled flag decides, and the tracestate sub-fields are
/// repaired rather than trusted: an out-of-range `r` or `p` is dropped, as is
/// a `p` that contradicts the sampled flag. Unlike
/// [`ConsistentProbabilityBased`] this sampler never invents a randomness
/// value of its own.
#[derive(Clone, Debug)]
pub struct ParentConsistentProbabilityBased {
    root: Box<dyn ShouldSample>,
}

impl ParentConsistentProbabilityBased {
    /// Create a sampler delegating root spans to `root`.
    pub fn new<S>(root: S) -> Self
    where
        S: ShouldSample + 'static,
    {
        ParentConsistentProbabilityBased {
            root: Box::new(root),
        }
    }
}

impl ShouldSample for ParentConsistentProbabilityBased {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        match parent_context.filter(|cx| cx.has_active_span()) {
            None => self
                .root
                .should_sample(parent_context, trace_id, name, span_kind, attributes, links),
            Some(ctx) => {
                let span = ctx.span();
                let parent_span_context = span.span_context();
                let trace_state = parent_span_context.trace_state();
                let ot = OtTraceState::parse(trace_state);

                let r = match ot.r {
                    Some(r) if r > MAX_RANDOMNESS_VALUE => {
                        otel_debug!(
                            name: "ParentConsistentProbabilityBased.PotentiallyInconsistentTrace",
                            message = "potentially inconsistent trace detected",
                            r = format!("{r:?}")
                        );
                        None
                    }
                    r => r,
                };

                if parent_span_context.is_sampled() {
                    let p = match ot.p {
                        Some(p) if p <= MAX_EXPONENT && r.map_or(true, |r| p <= r) => Some(p),
                        in_p => {
                            otel_debug!(
                                name: "ParentConsistentProbabilityBased.PotentiallyInconsistentTrace",
                                message = "potentially inconsistent trace detected",
                                p = format!("{in_p:?}")
                            );
                            None
                        }
                    };
                    SamplingResult {
                        decision: SamplingDecision::RecordAndSample,
                        attributes: Vec::new(),
                        trace_state: ot.update(trace_state, p, r),
                    }
                } else {
                    SamplingResult {
                        decision: SamplingDecision::Drop,
                        attributes: Vec::new(),
                        trace_state: ot.update(trace_state, None, r),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags};
    use opentelemetry_sdk::trace::Sampler;

    fn sampler(probability: f64) -> ConsistentProbabilityBased {
        ConsistentProbabilityBased::new(probability).unwrap()
    }

    fn parent_context(trace_id: TraceId, sampled: bool, ot: Option<&str>) -> Context {
        let trace_state = match ot {
            Some(value) => TraceState::from_key_value(vec![("ot", value)]).unwrap(),
            None => TraceState::default(),
        };
        let flags = if sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        let span_context =
            SpanContext::new(trace_id, SpanId::from_bytes((1u64).to_be_bytes()), flags, true, trace_state);
        Context::new().with_remote_span_context(span_context)
    }

    fn decide(
        s: &impl ShouldSample,
        trace_id: TraceId,
        parent: Option<&Context>,
    ) -> SamplingResult {
        s.should_sample(parent, trace_id, "test", &SpanKind::Internal, &[], &[])
    }

    // the low eight bytes of this id derive the maximum randomness value
    fn lucky_trace_id() -> TraceId {
        TraceId::from_bytes((1u128).to_be_bytes())
    }

    // and these derive zero
    fn unlucky_trace_id() -> TraceId {
        TraceId::from_bytes((u64::MAX as u128).to_be_bytes())
    }

    #[test]
    fn populates_tracestate_for_a_sampled_root_span() {
        let result = decide(&sampler(0.5), lucky_trace_id(), None);
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:62"));
    }

    #[test]
    fn populates_tracestate_for_an_unsampled_root_span() {
        let result = decide(&sampler(0.5), unlucky_trace_id(), None);
        assert_eq!(result.decision, SamplingDecision::Drop);
        assert_eq!(result.trace_state.get("ot"), Some("r:0"));
    }

    #[test]
    fn reuses_the_parent_randomness_for_a_sampled_child_span() {
        let tid = lucky_trace_id();
        let ctx = parent_context(tid, true, Some("p:1;r:1"));
        let result = decide(&sampler(0.5), tid, Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:1"));
    }

    #[test]
    fn drops_p_for_an_unsampled_child_span() {
        let tid = unlucky_trace_id();
        let ctx = parent_context(tid, true, Some("p:0;r:0"));
        let result = decide(&sampler(0.5), tid, Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::Drop);
        assert_eq!(result.trace_state.get("ot"), Some("r:0"));
    }

    #[test]
    fn regenerates_a_missing_randomness_value() {
        let tid = lucky_trace_id();
        let ctx = parent_context(tid, true, Some("p:1"));
        let result = decide(&sampler(0.5), tid, Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:62"));
    }

    #[test]
    fn regenerates_an_out_of_range_randomness_value() {
        let tid = lucky_trace_id();
        let ctx = parent_context(tid, true, Some("p:1;r:63"));
        let result = decide(&sampler(0.5), tid, Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:62"));
    }

    #[test]
    fn passes_through_unrelated_tracestate() {
        let tid = lucky_trace_id();
        let trace_state = TraceState::from_key_value(vec![
            ("congo", "t61rcWkgMzE"),
            ("ot", "p:1;r:1;extra:field"),
        ])
        .unwrap();
        let span_context = SpanContext::new(
            tid,
            SpanId::from_bytes((1u64).to_be_bytes()),
            TraceFlags::SAMPLED,
            true,
            trace_state,
        );
        let ctx = Context::new().with_remote_span_context(span_context);
        let result = decide(&sampler(0.5), tid, Some(&ctx));
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:1;extra:field"));
        assert_eq!(result.trace_state.get("congo"), Some("t61rcWkgMzE"));
    }

    #[test]
    fn a_stricter_sampler_never_outlives_a_permissive_one() {
        let mut rng = rand::rng();
        let strict = sampler(0.125);
        let permissive = sampler(0.5);
        for _ in 0..1000 {
            let trace_id = TraceId::from(rng.random::<u128>());
            if decide(&strict, trace_id, None).decision == SamplingDecision::RecordAndSample {
                assert_eq!(
                    decide(&permissive, trace_id, None).decision,
                    SamplingDecision::RecordAndSample,
                    "trace {trace_id:?} kept at 2^-3 but lost at 2^-1"
                );
            }
        }
    }

    #[test]
    fn sampling_converges_to_the_target_probability() {
        let total = 10_000;
        let mut rng = rand::rng();
        for probability in [0.0, 0.003, 0.1, 0.5, 0.75, 1.0] {
            let consistent = sampler(probability);
            let mut sampled = 0;
            for _ in 0..total {
                let trace_id = TraceId::from(rng.random::<u128>());
                if decide(&consistent, trace_id, None).decision
                    == SamplingDecision::RecordAndSample
                {
                    sampled += 1;
                }
            }
            let got = sampled as f64 / total as f64;
            let mut tolerance = 0.0;
            if probability > 0.0 && probability < 1.0 {
                // See https://en.wikipedia.org/wiki/Binomial_proportion_confidence_interval
                let z = 4.75342; // This should succeed 99.9999% of the time
                tolerance = z * (got * (1.0 - got) / total as f64).sqrt();
            }
            let diff = (got - probability).abs();
            assert!(
                diff <= tolerance,
                "probability {probability} got {got} (diff: {diff}, tolerance: {tolerance})"
            );
        }
    }

    #[test]
    fn rejects_probabilities_outside_the_unit_interval() {
        assert!(ConsistentProbabilityBased::new(-0.1).is_err());
        assert!(ConsistentProbabilityBased::new(1.1).is_err());
        assert!(ConsistentProbabilityBased::new(f64::NAN).is_err());
        assert!(ConsistentProbabilityBased::new(0.0).is_ok());
        assert!(ConsistentProbabilityBased::new(1.0).is_ok());
    }

    #[test]
    fn describes_the_nominal_probability() {
        assert_eq!(
            sampler(0.5).description(),
            "ConsistentProbabilityBased{0.500000}"
        );
        assert_eq!(
            sampler(1e-30).description(),
            "ConsistentProbabilityBased{0}"
        );
        assert_eq!(sampler(0.5), sampler(0.5));
        assert_ne!(sampler(0.5), sampler(0.25));
    }

    #[test]
    fn from_env_reads_the_sampler_argument() {
        temp_env::with_var(OTEL_TRACES_SAMPLER_ARG, Some("0.25"), || {
            assert_eq!(
                ConsistentProbabilityBased::from_env().description(),
                "ConsistentProbabilityBased{0.250000}"
            );
        });
        temp_env::with_var(OTEL_TRACES_SAMPLER_ARG, Some("banana"), || {
            assert_eq!(
                ConsistentProbabilityBased::from_env().description(),
                "ConsistentProbabilityBased{1.000000}"
            );
        });
        temp_env::with_var_unset(OTEL_TRACES_SAMPLER_ARG, || {
            assert_eq!(
                ConsistentProbabilityBased::from_env().description(),
                "ConsistentProbabilityBased{1.000000}"
            );
        });
    }

    #[test]
    fn parent_sampler_delegates_root_spans() {
        let parent = ParentConsistentProbabilityBased::new(sampler(0.5));
        let result = decide(&parent, lucky_trace_id(), None);
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:62"));

        let always_on = ParentConsistentProbabilityBased::new(Sampler::AlwaysOn);
        let result = decide(&always_on, unlucky_trace_id(), None);
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }

    #[test]
    fn parent_sampler_follows_the_sampled_flag() {
        let parent = ParentConsistentProbabilityBased::new(sampler(0.5));

        let ctx = parent_context(lucky_trace_id(), true, Some("p:1;r:1"));
        let result = decide(&parent, lucky_trace_id(), Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("p:1;r:1"));

        let ctx = parent_context(unlucky_trace_id(), false, Some("r:0"));
        let result = decide(&parent, unlucky_trace_id(), Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::Drop);
        assert_eq!(result.trace_state.get("ot"), Some("r:0"));
    }

    #[test]
    fn parent_sampler_clears_p_for_an_unsampled_parent() {
        let parent = ParentConsistentProbabilityBased::new(sampler(0.5));
        let ctx = parent_context(unlucky_trace_id(), false, Some("p:1;r:0"));
        let result = decide(&parent, unlucky_trace_id(), Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::Drop);
        assert_eq!(result.trace_state.get("ot"), Some("r:0"));
    }

    #[test]
    fn parent_sampler_repairs_inconsistent_sub_fields() {
        let parent = ParentConsistentProbabilityBased::new(sampler(0.5));

        // sampled flag without a p to back it up
        let ctx = parent_context(lucky_trace_id(), true, Some("r:5"));
        let result = decide(&parent, lucky_trace_id(), Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("r:5"));

        // p contradicting the randomness value
        let ctx = parent_context(lucky_trace_id(), true, Some("p:3;r:1"));
        let result = decide(&parent, lucky_trace_id(), Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get("ot"), Some("r:1"));

        // out-of-range randomness is dropped, not trusted
        let ctx = parent_context(unlucky_trace_id(), false, Some("r:63"));
        let result = decide(&parent, unlucky_trace_id(), Some(&ctx));
        assert_eq!(result.decision, SamplingDecision::Drop);
        assert_eq!(result.trace_state.get("ot"), None);
    }
}
