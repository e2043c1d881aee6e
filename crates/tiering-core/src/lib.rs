//! Shared configuration and error types for the tiering engine.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, EngineConfig, OrphanPolicy, TieringConfig};
pub use error::{Result, TieringError};
