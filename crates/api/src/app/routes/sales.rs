use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use pharmastock_core::SaleId;
use pharmastock_infra::SaleRequest;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(record_sale))
        .route("/:id", get(get_sale))
}

pub async fn record_sale(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SaleRequest>,
) -> axum::response::Response {
    match services.sales.record_sale(body).await {
        Ok(sale) => (StatusCode::CREATED, Json(sale)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_sale(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let sale_id: SaleId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.sales.get_sale(sale_id).await {
        Ok(sale) => Json(sale).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
