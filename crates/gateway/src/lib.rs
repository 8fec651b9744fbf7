#![deny(unused)]
//! HTTP gateway for LLM query dispatch.
//!
//! This crate provides the HTTP entry point for the system,
//! including response caching and rate limiting.

pub mod cache;
pub mod rate_limit;
pub mod server;

pub use cache::{CacheStats, InMemoryResponseCache, RedisResponseCache};
pub use rate_limit::{client_id_from_headers, RateLimiter, TokenBucket};
pub use server::{ApiError, GatewayConfig, GatewayServer};
