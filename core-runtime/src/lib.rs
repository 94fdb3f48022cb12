//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the archive pipeline:
//! - Logging and tracing infrastructure
//! - Configuration management
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the sync core and the
//! binary depend on. It establishes the logging conventions and the single
//! validated configuration value every other component is built from.

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
