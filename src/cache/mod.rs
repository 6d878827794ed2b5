use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{Reservation, ReservationStatus};
use crate::redis_client::RedisClient;

/// Минимум операций key-value, который нужен кешу броней.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> redis::RedisResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> redis::RedisResult<()>;
}

#[async_trait]
impl CacheStore for RedisClient {
    async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl_secs).await
    }
}

/// Кеш броней для чтения по id. Источник правды - БД: любая ошибка Redis
/// только логируется, запрос идет дальше без кеша.
///
/// Кешируются только брони в конечном статусе Cancelled. Живая бронь может
/// измениться в любой момент, и запоздалая запись читателя перетерла бы
/// результат параллельной отмены. Отмененная бронь больше не меняется, поэтому
/// инвалидировать нечего.
#[derive(Clone)]
pub struct ReservationCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

fn key(reservation_id: i64) -> String {
    format!("reservation:{}", reservation_id)
}

fn is_final(reservation: &Reservation) -> bool {
    reservation.status == ReservationStatus::Cancelled
}

impl ReservationCache {
    pub fn new<C: CacheStore>(store: C, ttl: Duration) -> Self {
        Self {
            store: Arc::new(store),
            ttl,
        }
    }

    pub async fn get(&self, reservation_id: i64) -> Option<Reservation> {
        let cached = match self.store.get(&key(reservation_id)).await {
            Ok(value) => value,
            Err(e) => {
                warn!("cache read failed for reservation {}: {:?}", reservation_id, e);
                return None;
            }
        };
        cached
            .and_then(|json| serde_json::from_str::<Reservation>(&json).ok())
            .filter(is_final)
    }

    /// Запоминает бронь, если она уже не изменится. Живые брони пропускаются.
    pub async fn remember(&self, reservation: &Reservation) {
        if !is_final(reservation) {
            debug!(reservation_id = reservation.id, "live reservation not cached");
            return;
        }
        let Ok(json) = serde_json::to_string(reservation) else {
            return;
        };
        let result = self
            .store
            .set_ex(&key(reservation.id), json, self.ttl.as_secs().max(1))
            .await;
        if let Err(e) = result {
            warn!("cache write failed for reservation {}: {:?}", reservation.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapStore {
        values: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl CacheStore for Arc<MapStore> {
        async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set_ex(&self, key: &str, value: String, _ttl_secs: u64) -> redis::RedisResult<()> {
            self.values.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
    }

    fn reservation(status: ReservationStatus) -> Reservation {
        Reservation {
            id: 3,
            user_id: 1,
            seat_id: 1,
            stadium_id: 1,
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn live_reservations_are_never_stored() {
        let store = Arc::new(MapStore::default());
        let cache = ReservationCache::new(store.clone(), Duration::from_secs(30));

        cache.remember(&reservation(ReservationStatus::Pending)).await;
        cache.remember(&reservation(ReservationStatus::Approved)).await;

        assert!(store.values.lock().unwrap().is_empty());
        assert!(cache.get(3).await.is_none());
    }

    #[tokio::test]
    async fn cancelled_reservation_is_served_from_cache() {
        let store = Arc::new(MapStore::default());
        let cache = ReservationCache::new(store.clone(), Duration::from_secs(30));
        let cancelled = reservation(ReservationStatus::Cancelled);

        cache.remember(&cancelled).await;

        assert_eq!(cache.get(3).await, Some(cancelled));
    }

    #[tokio::test]
    async fn stray_live_entry_is_ignored_on_read() {
        let store = Arc::new(MapStore::default());
        let pending = serde_json::to_string(&reservation(ReservationStatus::Pending)).unwrap();
        store.set_ex("reservation:3", pending, 30).await.unwrap();

        let cache = ReservationCache::new(store, Duration::from_secs(30));
        assert!(cache.get(3).await.is_none());
    }
}
