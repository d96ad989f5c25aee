//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → upstream.rs (Configuration: upstreams, handlers, hooks)
//!     → shared via Arc with the dispatcher
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a dispatcher starts
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Embedders can skip the file and build `Configuration` directly

pub mod loader;
pub mod schema;
pub mod upstream;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{ListenerConfig, Protocol, ProxyConfig, RouteConfig, UpstreamConfig};
pub use upstream::{Configuration, Route, Upstream};
pub use validation::ValidationError;
