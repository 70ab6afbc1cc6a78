//! tether-gateway: the gateway runtime.
//!
//! Sits between a thin mobile client and local resources: shells under
//! pseudo-terminals, and an AI coding assistant supervised as a long-lived
//! child process. One WebSocket per client carries chat, terminal I/O, and
//! connection control as multiplexed messages; the session runtime provides
//! sequencing, retry, and reconnection replay on top.

pub mod assistant;
pub mod chat;
pub mod cli;
pub mod connection;
pub mod pty;
pub mod server;
pub mod terminal;

pub use cli::Cli;
pub use server::GatewayConfig;
