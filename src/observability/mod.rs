//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! dispatcher, relays, connection tracker
//!     → logging.rs (tracing subscriber for the binary)
//!     → metrics.rs (counters and gauges, Prometheus exporter)
//! ```
//!
//! # Design Decisions
//! - The library only emits `tracing` events; installing a subscriber is
//!   left to the embedder or the binary
//! - Metric updates are cheap and safe to call without an installed recorder

pub mod logging;
pub mod metrics;
