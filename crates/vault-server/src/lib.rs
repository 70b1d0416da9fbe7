//! Consensus Vault server
//!
//! Serves the debate chatroom over server-sent events, the history and
//! council endpoints over JSON, and runs the background cleanup and
//! chatroom → council pipeline.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod stream;
pub mod tasks;

pub use config::{Cli, VaultConfig};
pub use error::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
