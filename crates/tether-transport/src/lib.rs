//! # tether-transport
//!
//! The wait call and everything needed to interpret its answer.
//!
//! - [`session`]: [`WaitTransport`] and its MCP streamable-HTTP implementation [`McpTransport`]
//! - [`decode`]: prioritized decode strategies turning any known payload shape into [`Event`]s
//! - [`heartbeat`]: [`HeartbeatMonitor`] fed by the transport, watched by the supervisor
//! - [`rpc`]: JSON-RPC envelopes and tool result unwrapping
//! - [`sse`]: incremental `text/event-stream` decoding
//!
//! [`Event`]: tether_core::Event

#![deny(unsafe_code)]

pub mod decode;
pub mod errors;
pub mod heartbeat;
pub mod rpc;
pub mod session;
pub mod sse;

pub use decode::decode_events;
pub use errors::{ProtocolError, TransportError, WaitError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatResult};
pub use session::{McpTransport, WaitTransport};
