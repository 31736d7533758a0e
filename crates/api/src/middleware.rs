use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::app::errors;

/// Per-request deadline. An expired request is dropped mid-flight, which
/// drops its open transaction and rolls it back.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub timeout: Duration,
}

pub async fn deadline_middleware(State(deadline): State<Deadline>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    match tokio::time::timeout(deadline.timeout, next.run(req)).await {
        Ok(resp) => {
            tracing::debug!(
                %method,
                %path,
                status = resp.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request handled"
            );
            resp
        }
        Err(_) => {
            tracing::warn!(%method, %path, timeout_ms = deadline.timeout.as_millis() as u64, "request timed out");
            errors::timeout_response()
        }
    }
}
