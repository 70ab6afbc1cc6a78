//! PTY-backed terminal sessions.
//!
//! A [`session::TerminalSession`] owns one PTY pair and one child shell;
//! the [`manager::TerminalManager`] owns the set of sessions for a
//! connection, enforces the cap, and reaps idle ones. The
//! [`handler::TerminalHandler`] translates terminal wire messages into
//! manager operations.

pub mod handler;
pub mod manager;
pub mod session;

pub use handler::{CreatedTerminal, TerminalHandler};
pub use manager::{ManagerConfig, TerminalManager};
pub use session::{TerminalConfig, TerminalSession, TerminalState};
