//! Core traits for the dispatch gateway.
//!
//! - `provider`: backend clients the router dispatches to (ProviderClient)
//! - `cache`: response stores consulted before dispatch (ResponseCache)

pub mod cache;
pub mod provider;

pub use cache::*;
pub use provider::*;
