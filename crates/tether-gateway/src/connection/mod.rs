//! Per-connection session runtime and transport plumbing.

pub mod runtime;
pub mod transport;

pub use runtime::{BatchConfig, RuntimeConfig, SessionDeps, SessionRuntime};
pub use transport::{
    split_ws, Inbound, TransportReader, TransportWriter, WireMode, WsReader, WsWriter,
};
