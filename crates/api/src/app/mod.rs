//! HTTP application wiring (Axum router + engine wiring).
//!
//! - `services.rs`: store selection and the engines built on it
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: domain error to HTTP response mapping

use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware::{self, Deadline};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: AppServices, request_timeout: Duration) -> Router {
    let deadline = Deadline { timeout: request_timeout };

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(deadline, middleware::deadline_middleware))
                .layer(Extension(Arc::new(services))),
        )
}
