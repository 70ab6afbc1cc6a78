//! Test utilities for the tether gateway.
//!
//! Provides a channel-backed transport pair for driving a session runtime
//! without a network, and a scripted assistant stub that satisfies the
//! chat-handler contract.

pub mod mock_transport;
pub mod stub_assistant;

pub use mock_transport::{mock_transport, MockClient, MockReader, MockWriter};
pub use stub_assistant::StubAssistant;
