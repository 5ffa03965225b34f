//! Cucumber step definitions for interface tests.

pub mod delivery;
pub mod materialization;
