use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;

use pharmastock_core::BatchId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/warehouse", get(warehouse_stock))
        .route("/expiring", get(expiring))
        .route("/:id", get(get_batch))
        .route("/:id/movements", get(movements))
}

pub async fn warehouse_stock(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.ledger.warehouse_stock().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

/// Near-expiry feed, relative to today's UTC date.
pub async fn expiring(
    Extension(services): Extension<Arc<AppServices>>,
    Query(q): Query<dto::ExpiringQuery>,
) -> axum::response::Response {
    let today = Utc::now().date_naive();
    match services.ledger.expiring_within(q.within_days, today).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id: BatchId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.ledger.batch(batch_id).await {
        Ok(batch) => Json(batch).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn movements(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id: BatchId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.ledger.movements_for_batch(batch_id).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
