//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory master/slave pair behind an [`Agent`](ha_replicator::Agent)
//! - Point builders anchored at a clock's "now"

pub mod cluster;

pub use cluster::*;
