use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use pharmastock_core::ProductId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_product))
        .route("/:id", get(get_product).put(update_product).delete(delete_product))
        .route("/:id/allocations", post(add_allocation))
        .route("/:id/quote", get(quote))
}

/// Create a product by binding stock from a warehouse row.
pub async fn create_product(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateProductRequest>,
) -> axum::response::Response {
    match services
        .allocations
        .create_product(body.batch_id, body.quantity, body.attrs)
        .await
    {
        Ok(allocation) => (StatusCode::CREATED, Json(dto::AllocationResponse::from(allocation))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let product_id: ProductId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.catalog.get_product(product_id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn update_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateProductRequest>,
) -> axum::response::Response {
    let product_id: ProductId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.catalog.update_product(product_id, body.attrs, body.lines).await {
        Ok(detail) => Json(detail).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn delete_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let product_id: ProductId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.catalog.delete_product(product_id).await {
        Ok(mode) => Json(serde_json::json!({ "id": product_id, "deletion": mode })).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn add_allocation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::AddAllocationRequest>,
) -> axum::response::Response {
    let product_id: ProductId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .allocations
        .add_allocation(product_id, body.batch_id, body.quantity)
        .await
    {
        Ok(allocation) => Json(dto::AllocationResponse::from(allocation)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn quote(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(q): Query<dto::QuoteQuery>,
) -> axum::response::Response {
    let product_id: ProductId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.sales.quote(product_id, q.qty).await {
        Ok(quote) => Json(quote).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
