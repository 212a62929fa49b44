//! Common test utilities shared across the `dualgpu-foundation` integration
//! tests.
//!
//! Not a standalone test binary: declared with `mod common;` in each test
//! file that needs it.

pub mod fixtures;
