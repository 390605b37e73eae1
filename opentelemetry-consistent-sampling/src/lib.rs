//! Consistent probability sampling for [OpenTelemetry].
//!
//! The built-in `TraceIdRatioBased` sampler makes each service decide on its
//! own, so two services sampling the same trace at different rates produce
//! broken traces. The samplers in this crate implement the OpenTelemetry
//! [probability sampling] scheme instead: every trace carries a randomness
//! value `r` in the `ot` entry of the W3C tracestate header, each sampler
//! compares a power-of-two threshold exponent `p` against it, and a span is
//! sampled exactly when `p <= r`. Samplers at different rates then keep
//! nested subsets of traces, and the recorded `p` lets backends reweight
//! span counts by the effective sampling rate.
//!
//! [`ConsistentProbabilityBased`] decides with a configurable probability,
//! decomposed into the two bracketing power-of-two rates; its long-run
//! sampling rate equals the configured value exactly.
//! [`ParentConsistentProbabilityBased`] follows the parent span's decision
//! and keeps the propagated state consistent with it. The
//! [`tracestate`] module exposes the `ot` entry codec for other sampler
//! implementations that want to participate in the protocol.
//!
//! ## Example
//!
//! ```
//! use opentelemetry_consistent_sampling::{
//!     ConsistentProbabilityBased, ParentConsistentProbabilityBased,
//! };
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // sample a quarter of all traces, honoring upstream decisions
//! let sampler = ParentConsistentProbabilityBased::new(ConsistentProbabilityBased::new(0.25)?);
//! let provider = SdkTracerProvider::builder().with_sampler(sampler).build();
//! # drop(provider);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `internal-logs` (default): emit self-diagnostics, such as detection of
//!   inconsistent upstream sampling state, through OpenTelemetry's internal
//!   logging macros.
//!
//! [OpenTelemetry]: https://opentelemetry.io
//! [probability sampling]: https://opentelemetry.io/docs/specs/otel/trace/tracestate-probability-sampling/
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]
#![cfg_attr(test, deny(warnings))]

pub mod probability;
mod sampler;
pub mod tracestate;

pub use sampler::{ConsistentProbabilityBased, InvalidProbability, ParentConsistentProbabilityBased};
