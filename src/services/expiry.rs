use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::reservations::ReservationManager;
use crate::storage::Storage;

/// Периодически снимает неоплаченные брони, которые висят в Pending дольше `hold_ttl`.
pub struct ExpirySweeper<S: Storage> {
    manager: ReservationManager<S>,
    hold_ttl: Duration,
    interval: Duration,
}

impl<S: Storage> ExpirySweeper<S> {
    pub fn new(
        manager: ReservationManager<S>,
        hold_ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            hold_ttl,
            interval,
        }
    }

    /// Один проход. Возвращает число истекших броней.
    pub async fn sweep_once(&self) -> usize {
        let Ok(ttl) = ChronoDuration::from_std(self.hold_ttl) else {
            return 0;
        };
        let Some(older_than) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };

        let stale = match self.manager.storage().list_stale_pending(older_than).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to list stale reservations: {:?}", e);
                return 0;
            }
        };
        if stale.is_empty() {
            return 0;
        }

        info!("🧹 Found {} stale pending reservations", stale.len());

        let mut expired = 0;
        for reservation_id in stale {
            // Между выборкой и блокировкой бронь могли оплатить или отменить - тогда false
            match self.manager.expire(reservation_id).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to expire reservation {}: {:?}", reservation_id, e),
            }
        }

        info!("✅ Expired {} reservations", expired);
        expired
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
            info!("Expiry sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReservationStatus, SeatStatus};
    use crate::services::{CriticalSection, NotificationDispatcher};
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn manager(storage: &Arc<MemoryStorage>) -> ReservationManager<MemoryStorage> {
        ReservationManager::new(
            storage.clone(),
            Arc::new(CriticalSection::new()),
            Arc::new(NotificationDispatcher::start(storage.clone())),
        )
    }

    #[tokio::test]
    async fn expires_pending_reservations_past_hold_ttl() {
        let storage = Arc::new(MemoryStorage::new());
        let event = storage.insert_event(1, Utc::now() + ChronoDuration::hours(2));
        let pending_seat = storage.insert_seat(1);
        let approved_seat = storage.insert_seat(1);
        let manager = manager(&storage);

        let pending = manager.reserve(event.id, pending_seat.id, 1).await.unwrap();
        let approved = manager.reserve(event.id, approved_seat.id, 2).await.unwrap();
        manager.approve(approved.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeper = ExpirySweeper::new(manager.clone(), Duration::ZERO, Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await, 1);

        let pending = manager.get(pending.id).await.unwrap();
        assert_eq!(pending.status, ReservationStatus::Cancelled);
        assert_eq!(storage.seat(pending_seat.id).unwrap().status, SeatStatus::Available);
        assert_eq!(storage.seat(approved_seat.id).unwrap().status, SeatStatus::Held);
    }

    #[tokio::test]
    async fn fresh_reservations_are_left_alone() {
        let storage = Arc::new(MemoryStorage::new());
        let event = storage.insert_event(1, Utc::now() + ChronoDuration::hours(2));
        let seat = storage.insert_seat(1);
        let manager = manager(&storage);
        manager.reserve(event.id, seat.id, 1).await.unwrap();

        let sweeper = ExpirySweeper::new(manager, Duration::from_secs(900), Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await, 0);
        assert_eq!(storage.seat(seat.id).unwrap().status, SeatStatus::Held);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown_signal() {
        let storage = Arc::new(MemoryStorage::new());
        let sweeper = ExpirySweeper::new(
            manager(&storage),
            Duration::from_secs(900),
            Duration::from_millis(10),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = sweeper.spawn(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
