//! Infrastructure - configuration, metrics, and error types
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free poll loop metrics
//! - `error` - Typed errors at the histogram source boundary

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, ModeProfile, ModesConfig};
pub use error::SourceError;
pub use metrics::Metrics;
