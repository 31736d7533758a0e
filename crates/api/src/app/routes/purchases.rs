use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use pharmastock_core::InvoiceId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(receive_invoice))
        .route("/:id", get(get_invoice).put(update_invoice).delete(delete_invoice))
        .route("/:id/payment", post(set_payment))
}

pub async fn receive_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::InvoiceRequest>,
) -> axum::response::Response {
    match services.intake.receive(body.header, body.lines).await {
        Ok(detail) => (StatusCode::CREATED, Json(dto::InvoiceResponse::from(detail))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id: InvoiceId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.intake.get(invoice_id).await {
        Ok(detail) => Json(dto::InvoiceResponse::from(detail)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn update_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::InvoiceRequest>,
) -> axum::response::Response {
    let invoice_id: InvoiceId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.intake.update(invoice_id, body.header, body.lines).await {
        Ok(detail) => Json(dto::InvoiceResponse::from(detail)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn delete_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let invoice_id: InvoiceId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.intake.delete(invoice_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn set_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::PaymentRequest>,
) -> axum::response::Response {
    let invoice_id: InvoiceId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let result = match body.payment_date() {
        Ok(Some(date)) => services.intake.mark_paid(invoice_id, date).await,
        Ok(None) => services.intake.mark_unpaid(invoice_id).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(invoice) => Json(dto::InvoiceSummary::from(&invoice)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
