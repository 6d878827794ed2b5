use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Cancelled,
}

impl ReservationStatus {
    /// Живая бронь удерживает место (Pending или Approved).
    pub fn is_live(self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub user_id: i64,
    pub seat_id: i64,
    pub stadium_id: i64,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

// Данные для вставки, id и created_at проставляет хранилище
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub user_id: i64,
    pub seat_id: i64,
    pub stadium_id: i64,
    pub status: ReservationStatus,
}
