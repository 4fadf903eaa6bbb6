//! # tether-runtime
//!
//! Everything that runs a session once its collaborators exist.
//!
//! - [`supervisor`]: [`ReconnectSupervisor`], the connection state machine and control loop
//! - [`dedup`]: [`DedupTracker`], durable record of processed event ids
//! - [`dispatch`]: [`EventHandler`] trait, [`HandlerRegistry`], and [`HandlerDispatcher`]
//! - [`shutdown`]: [`ShutdownCoordinator`], the single cancellation entry point

#![deny(unsafe_code)]

pub mod dedup;
pub mod dispatch;
pub mod errors;
pub mod shutdown;
pub mod supervisor;

pub use dedup::{DedupTracker, RetentionPolicy};
pub use dispatch::{
    AckHandler, DispatchMode, EventHandler, HandlerContext, HandlerDispatcher, HandlerRegistry,
    LogHandler,
};
pub use errors::{DedupError, HandlerError, RegistryError};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::{
    CredentialProvider, ReconnectSupervisor, SessionOutcome, SupervisorConfig, SupervisorParts,
    Transition,
};
