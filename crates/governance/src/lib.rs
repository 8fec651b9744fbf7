#![deny(unused)]
//! Governance for the LLM dispatch gateway.
//!
//! This crate provides:
//! - Structured logging setup
//! - Prometheus metrics recorder and helpers

pub mod metrics;
pub mod tracing_layer;

pub use metrics::{
    setup_metrics_recorder, track_cache_lookup, track_query, track_rate_limited, track_request,
    track_tokens, QueryOutcome,
};
pub use tracing_layer::configure_tracing;
