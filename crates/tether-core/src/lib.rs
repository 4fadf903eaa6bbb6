//! # tether-core
//!
//! Foundation types shared by every tether crate.
//!
//! - [`event`]: normalized [`Event`] values and the [`WaitRequest`] sent on each long-poll
//! - [`state`]: the session [`ConnectionState`] machine states
//! - [`identity`]: [`AgentIdentity`] and the routing headers attached to outbound calls
//! - [`retry`]: bounded exponential [`Backoff`] with a consecutive-failure cap
//! - [`ids`]: branded string identifiers
//! - [`errors`]: the fatal [`ErrorKind`] taxonomy reported when a session halts
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod event;
pub mod identity;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod state;

pub use errors::ErrorKind;
pub use event::{Event, ListMode, WaitMode, WaitRequest};
pub use identity::{AgentIdentity, IdentityManager};
pub use ids::{ClientInstanceId, EventId, RunId};
pub use retry::{Backoff, BackoffPolicy, BackoffStep};
pub use state::ConnectionState;
