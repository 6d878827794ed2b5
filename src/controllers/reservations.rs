use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use crate::error::{ReservationError, ValidationError};
use crate::storage::Storage;
use crate::AppState;

pub fn routes<S: Storage>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/reservations", post(create_reservation::<S>))
        .route("/reservations/{id}", get(get_reservation::<S>))
        .route("/reservations/{id}/cancel", post(cancel_reservation::<S>))
        .route("/reservations/{id}/approve", post(approve_reservation::<S>))
}

/* ---------- helpers ---------- */

// Тонкий перевод доменных ошибок в HTTP-коды
fn error_response(err: ReservationError) -> (StatusCode, String) {
    let status = match &err {
        ReservationError::Validation(ValidationError::EventNotFound(_))
        | ReservationError::Validation(ValidationError::SeatNotFound(_))
        | ReservationError::NotFound(_) => StatusCode::NOT_FOUND,
        ReservationError::Validation(ValidationError::EventNotActive(_))
        | ReservationError::Validation(ValidationError::SeatWrongStadium { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ReservationError::SeatUnavailable(_) | ReservationError::ConcurrencyConflict => {
            StatusCode::CONFLICT
        }
        ReservationError::Storage(e) => {
            tracing::error!("reservation storage error: {:?}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Ошибка хранилища".to_string());
        }
    };
    (status, err.to_string())
}

fn validate_id(id: i64) -> Result<(), (StatusCode, String)> {
    if id <= 0 {
        return Err((StatusCode::BAD_REQUEST, "id должен быть > 0".to_string()));
    }
    Ok(())
}

/* ---------- RESERVATIONS ---------- */

// POST /api/reservations
#[derive(Debug, Deserialize, Validate)]
struct CreateReservationRequest {
    #[validate(range(min = 1))]
    pub event_id: i64,
    #[validate(range(min = 1))]
    pub seat_id: i64,
    #[validate(range(min = 1))]
    pub user_id: i64,
}

async fn create_reservation<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateReservationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.validate().is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            "event_id, seat_id и user_id должны быть > 0".to_string(),
        ));
    }

    let reservation = state
        .reservations
        .reserve(req.event_id, req.seat_id, req.user_id)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(reservation)))
}

// GET /api/reservations/{id}
async fn get_reservation<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_id(id)?;

    if let Some(cache) = &state.cache {
        if let Some(reservation) = cache.get(id).await {
            return Ok((StatusCode::OK, Json(reservation)));
        }
    }

    let reservation = state.reservations.get(id).await.map_err(error_response)?;

    // Живые брони кеш сам пропустит: их читаем из БД каждый раз
    if let Some(cache) = &state.cache {
        cache.remember(&reservation).await;
    }

    Ok((StatusCode::OK, Json(reservation)))
}

// POST /api/reservations/{id}/cancel
async fn cancel_reservation<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_id(id)?;

    let cancelled = state.reservations.cancel(id).await.map_err(error_response)?;
    if !cancelled {
        return Err((
            StatusCode::NOT_FOUND,
            "Бронь не найдена или уже отменена".to_string(),
        ));
    }

    Ok(StatusCode::NO_CONTENT)
}

// POST /api/reservations/{id}/approve
async fn approve_reservation<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_id(id)?;

    let approved = state.reservations.approve(id).await.map_err(error_response)?;
    if !approved {
        return Err((
            StatusCode::NOT_FOUND,
            "Бронь не найдена или не ожидает подтверждения".to_string(),
        ));
    }

    Ok(StatusCode::NO_CONTENT)
}
