#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use seat_reservation::models::{Event, NotificationRecord, Seat};
use seat_reservation::services::{CriticalSection, NotificationDispatcher, ReservationManager};
use seat_reservation::storage::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;

pub const STADIUM: i64 = 1;

pub struct World {
    pub storage: Arc<MemoryStorage>,
    pub event: Event,
    pub seat: Seat,
}

pub fn world() -> World {
    let storage = Arc::new(MemoryStorage::new());
    let event = storage.insert_event(STADIUM, Utc::now() + ChronoDuration::hours(1));
    let seat = storage.insert_seat(STADIUM);
    World {
        storage,
        event,
        seat,
    }
}

/// Менеджер со своей критической секцией - как отдельный экземпляр сервиса.
pub fn instance(storage: &Arc<MemoryStorage>) -> ReservationManager<MemoryStorage> {
    ReservationManager::new(
        storage.clone(),
        Arc::new(CriticalSection::new()),
        Arc::new(NotificationDispatcher::start(storage.clone())),
    )
}

pub async fn wait_for_notifications<F>(storage: &MemoryStorage, done: F) -> Vec<NotificationRecord>
where
    F: Fn(&[NotificationRecord]) -> bool,
{
    for _ in 0..400 {
        let records = storage.notifications();
        if done(&records) {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("notifications never arrived: {:?}", storage.notifications());
}
