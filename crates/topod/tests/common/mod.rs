//! Shared test utilities for topod integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against an in-memory store
//! - `DeclarationBuilder` for writing resource declarations

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
