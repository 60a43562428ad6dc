//! # brpc-server
//!
//! RPC server for brpc.
//!
//! This crate provides:
//! - Service definitions built from typed method closures
//! - A concurrent service registry
//! - Connection handling with per-connection codec negotiation
//! - Concurrent request handling with optional handling timeouts
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;

pub use config::{Config, ConfigError, NetworkConfig, RpcConfig};
pub use error::{RegistryError, ServerError};
pub use registry::Registry;
pub use server::{handle_timeout_error, sent_timeout_error, Server, ServerConfig, ServerStats};
pub use service::{is_exported, MethodDescriptor, PreparedCall, Service, ServiceBuilder};
