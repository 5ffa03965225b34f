//! Event handlers for the service binaries.

mod materialize;

pub use materialize::MaterializeHandler;
