//! Courier - identity event propagation
//!
//! Carries identity events from the service where they originate to the
//! services that keep a local copy. Events travel over durable topic
//! exchanges with manual acknowledgement; receivers upsert them into a local
//! store so duplicate deliveries are harmless.
//!
//! ```text
//! [identity.events] -> [relay] -> [directory.events] -> [cache]
//!                         |                                |
//!                         v                                v
//!                   [directory store]                [cache store]
//! ```

pub mod bus;
pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod materializer;
pub mod storage;
pub mod utils;
