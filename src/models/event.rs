use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Событие принадлежит внешнему каталогу, здесь только читаем
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub stadium_id: i64,
    pub start_time: DateTime<Utc>,
}

impl Event {
    /// Бронировать можно только на события, которые еще не начались.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_time > now
    }
}
