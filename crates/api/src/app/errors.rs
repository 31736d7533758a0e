use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use pharmastock_core::DomainError;

pub fn domain_error_to_response(err: DomainError) -> Response {
    let retryable = err.is_retryable();
    match err {
        DomainError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": "validation_error",
                "field": field,
                "message": message,
                "retryable": false,
            })),
        )
            .into_response(),
        DomainError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({
                "error": "not_found",
                "entity": entity,
                "id": id,
                "message": format!("{entity} {id} not found"),
                "retryable": false,
            })),
        )
            .into_response(),
        DomainError::InsufficientStock { line, requested, available } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "insufficient_stock",
                "line": line,
                "requested": requested,
                "available": available,
                "message": format!("requested {requested}, only {available} available"),
                "retryable": false,
            })),
        )
            .into_response(),
        DomainError::Conflict { message, .. } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "conflict",
                "message": message,
                "retryable": retryable,
            })),
        )
            .into_response(),
        DomainError::Storage(message) => {
            tracing::error!(%message, "storage failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({
                    "error": "storage_error",
                    "message": message,
                    "retryable": retryable,
                })),
            )
                .into_response()
        }
    }
}

/// The request ran past its deadline and everything it did was rolled back.
pub fn timeout_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(json!({
            "error": "timeout",
            "message": "request timed out; no changes were applied",
            "retryable": true,
        })),
    )
        .into_response()
}

/// Map a path segment to a typed id, or a 400.
pub fn parse_id<T>(raw: &str) -> Result<T, Response>
where
    T: core::str::FromStr<Err = DomainError>,
{
    raw.parse().map_err(domain_error_to_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        let cases = [
            (DomainError::validation("quantity", "must be positive"), StatusCode::BAD_REQUEST),
            (DomainError::not_found("product", "p1"), StatusCode::NOT_FOUND),
            (DomainError::insufficient_stock(5, 2), StatusCode::UNPROCESSABLE_ENTITY),
            (DomainError::conflict("invoice number taken"), StatusCode::CONFLICT),
            (DomainError::contention("lock timeout"), StatusCode::CONFLICT),
            (DomainError::storage("disk full"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(domain_error_to_response(err).status(), status);
        }
        assert_eq!(timeout_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn malformed_ids_are_bad_requests() {
        let resp = parse_id::<pharmastock_core::ProductId>("not-a-uuid").unwrap_err();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
