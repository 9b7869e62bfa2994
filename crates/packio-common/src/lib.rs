//! PackIO Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and configuration
//! used by the storage engine, the node daemon and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, EngineConfig};
pub use error::{Error, Result};
pub use types::*;
