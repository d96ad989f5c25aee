//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, socket options)
//!     → idle.rs (read/write idle timeout)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (lifecycle tracking for shutdown)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection and WebSocket tunnel is tracked for shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod idle;
pub mod listener;
pub mod tls;
