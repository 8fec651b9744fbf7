//! Core type definitions for the dispatch gateway.
//!
//! Broken down into submodules for better maintainability.

pub mod availability;
pub mod provider;
pub mod query;

pub use availability::*;
pub use provider::*;
pub use query::*;
