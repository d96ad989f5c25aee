//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Hooks (hooks.rs):
//!     request / stream / session / upgrade → before & after callbacks
//!
//! Shutdown (shutdown.rs):
//!     stop() → stop accepting → drain (bounded) → force → closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful stop; a second signal forces
//! ```
//!
//! # Design Decisions
//! - Hooks observe, they never change the proxying outcome
//! - Shutdown state only moves forward
//! - Shutdown has timeout: forced close after deadline

pub mod hooks;
pub mod shutdown;
pub mod signals;

pub use hooks::{HookRunner, Hooks};
pub use shutdown::{Shutdown, ShutdownSignal, ShutdownState};
