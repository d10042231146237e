//! Stateless AI egress gateway: authenticates internal callers, gates
//! requests on per-project token budgets, injects provider credentials
//! just-in-time, and settles actual usage after each response.

pub mod accounting;
pub mod budget;
pub mod config;
mod error;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod routing;
pub mod schema;
pub mod secrets;
pub mod server;
pub mod stream;
pub mod upstream;
pub mod usage;

pub use config::{ConfigError, Env, Settings};
pub use error::{GatewayError, Result};
pub use server::{router, AppState};
