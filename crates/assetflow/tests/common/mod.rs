//! Shared test utilities for assetflow integration tests.
//!
//! This module provides:
//! - `TestHarness` with a temp-dir database and a scriptable extractor
//! - `ProcessBuilder` for process fixtures

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
