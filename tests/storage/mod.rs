//! Shared storage integration tests.
//!
//! Tests the IdentityStore interface against every implementation. Each
//! implementation test binary imports these functions and runs them.

pub mod identity_store_tests;
