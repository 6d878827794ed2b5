pub mod reservations;

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::storage::Storage;
use crate::AppState;

pub fn routes<S: Storage>() -> Router<Arc<AppState<S>>> {
    Router::new().merge(reservations::routes::<S>())
}

/// Полный роутер приложения: /health и все под /api.
pub fn app<S: Storage>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/", get(|| async { "Seat Reservation API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", routes::<S>())
        .with_state(state)
}
