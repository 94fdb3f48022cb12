//! # HTTP Object Store Provider
//!
//! Implements the `ObjectStore` bridge trait for the remote archive API.
//!
//! ## Overview
//!
//! This module provides:
//! - Object put/get/stat/delete over HTTP with metadata headers
//! - Paginated prefix listing
//! - Retryable vs. permanent failure classification from HTTP status codes
//! - `LOW access:secret` authentication from `RemoteStoreConfig`

pub mod connector;
pub mod error;
pub mod types;

pub use connector::HttpObjectStore;
pub use error::{Result, StoreError};
