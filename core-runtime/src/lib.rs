//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the offline sync core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! Every other core crate depends on this one. It fixes the logging conventions,
//! the fail-fast configuration builder and the broadcast channel that carries
//! cache and download events to the host.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
