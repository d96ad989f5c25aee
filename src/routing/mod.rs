//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (method, path, headers) + request Context
//!     → router.rs (scan upstreams in declaration order)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: upstream + handler, or no match
//! ```
//!
//! # Design Decisions
//! - Routes are fixed at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Matchers may read the request Context, so hooks can steer routing
//! - First match wins

pub mod matcher;
pub mod router;

pub use matcher::{matcher_fn, AndMatcher, AnyMatcher, HostMatcher, Matcher, MethodMatcher, PathPrefixMatcher};
pub use router::{RouteKind, RouteMatch, Router};
