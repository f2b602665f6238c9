//! HTTP API module.
//!
//! Thin REST surface over the supervisor, settings store and installer,
//! plus a server-sent event stream for install progress.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, Managed, MessageResponse};
pub use routes::create_router;
pub use state::{AppState, PORTS_RESOURCE, StateOptions};
