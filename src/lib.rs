//! Adgate — upstream ad gateway library
//!
//! Turns abstract ad requests into fully resolved ad responses: typed
//! upstreams over pluggable transports, a middleware stack (retry,
//! circuit breaking, caching, frequency caps, budgets), VAST parsing and
//! macro substitution, bounded wrapper-chain resolution with fallbacks,
//! and per-request session state over a pluggable backend.

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod types;
pub mod upstream;
pub mod vast;

pub use error::{GatewayError, Result};
pub use gateway::{AdHandler, Gateway, GatewayConfig};
pub use resolver::{ChainResolver, ResolutionResult, ResolverConfig};
pub use session::{SessionContext, StateBackend};
pub use types::{AdRequest, AdResponse, MediaFile};
