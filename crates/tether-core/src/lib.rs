//! tether-core: shared protocol, framing, and queueing for the tether gateway.
//!
//! This crate provides:
//! - The canonical message model and its wire renderings
//! - Length-prefixed frame codec with optional compression and batching
//! - The sequenced message queue (retry / ack / replay-after)
//! - Error types, constants, and logging setup

pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod queue;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
