#![deny(unused)]
//! Core types, traits, and error definitions for the LLM dispatch gateway.
//!
//! This crate provides the building blocks shared by the routing layer,
//! the cache and rate limiter, and the HTTP surface.

pub mod config;
pub mod context;
pub mod error;
pub mod mocks;
pub mod traits;
pub mod types;

pub use context::RequestContext;
pub use error::{Error, ErrorKind, ProviderError, Result};
pub use traits::{ProviderClient, ResponseCache};
pub use types::{
    AvailabilitySnapshot, ParallelQueryResponse, Provider, ProviderCompletion, ProviderOutcome,
    QueryRequest, QueryResponse, RouteDecision, RouteReason, TaskType,
};
