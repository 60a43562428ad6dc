//! # brpc-client
//!
//! Client library for brpc.
//!
//! This crate provides:
//! - A multiplexed client: many concurrent calls over one connection
//! - Call contexts with cancellation and deadlines
//! - Service discovery with random and round-robin selection
//! - A load-balanced `XClient` with per-endpoint connection caching and broadcast

pub mod client;
pub mod context;
pub mod discovery;
pub mod error;
pub mod xclient;

#[cfg(test)]
mod testing;

pub use client::{parse_endpoint, Client};
pub use context::Context;
pub use discovery::{Discovery, SelectMode, StaticDiscovery};
pub use error::{ClientError, ContextError, DiscoveryError};
pub use xclient::{XClient, XClientConfig};
