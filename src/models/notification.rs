use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    ReservationCreated,
    ReservationApproved,
    ReservationCancelled,
    ReservationExpired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ReservationCreated => "ReservationCreated",
            NotificationKind::ReservationApproved => "ReservationApproved",
            NotificationKind::ReservationCancelled => "ReservationCancelled",
            NotificationKind::ReservationExpired => "ReservationExpired",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Событие жизненного цикла брони, которое уходит в очередь уведомлений.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub event_id: Uuid,
    pub reservation_id: i64,
    pub kind: NotificationKind,
    pub occurred_at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl ReservationEvent {
    pub fn new(reservation_id: i64, kind: NotificationKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            reservation_id,
            kind,
            occurred_at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    // Без detail сообщением служит имя типа
    pub fn message(&self) -> String {
        self.detail
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }
}

// Запись в таблице notifications, только добавление
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub reservation_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotificationRecord {
    pub reservation_id: i64,
    pub kind: NotificationKind,
    pub message: String,
}

impl From<&ReservationEvent> for NewNotificationRecord {
    fn from(event: &ReservationEvent) -> Self {
        Self {
            reservation_id: event.reservation_id,
            kind: event.kind,
            message: event.message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_falls_back_to_kind_name() {
        let event = ReservationEvent::new(7, NotificationKind::ReservationCancelled);
        assert_eq!(event.message(), "ReservationCancelled");

        let event = event.with_detail("seat 3 released");
        assert_eq!(NewNotificationRecord::from(&event).message, "seat 3 released");
    }
}
