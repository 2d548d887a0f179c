//! Multiflex Common - Shared types and utilities
//!
//! This crate provides the error type, the persisted field encodings and
//! the configuration types used by all Multiflex components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, LoggingConfig, StoreConfig};
pub use error::{BoxError, Error, Result};
pub use types::*;
