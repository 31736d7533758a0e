use axum::Router;

pub mod batches;
pub mod products;
pub mod purchases;
pub mod sales;
pub mod system;

/// Router for every business endpoint.
pub fn router() -> Router {
    Router::new()
        .nest("/purchases", purchases::router())
        .nest("/batches", batches::router())
        .nest("/products", products::router())
        .nest("/sales", sales::router())
}
