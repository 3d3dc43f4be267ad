//! Common utilities and types shared across the fieldsync crates.
//!
//! This module provides the error type, agent identity, geo positions and
//! image payloads that the storage and sync layers pass between each other.

pub mod error;
pub mod types;

pub use error::{Error, LocationErrorKind, Result};
pub use types::{format_duration, format_file_size, AgentId, GeoPosition, ImageFile};
