//! Хранилище в памяти процесса.
//!
//! Повторяет то, на что опирается менеджер броней в Postgres: эксклюзивные
//! блокировки строк до конца транзакции, запись только при commit, одна живая
//! бронь на место (аналог частичного уникального индекса). Дополнительно умеет
//! имитировать сбои: конфликт при фиксации, задержку commit, недоступность.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use super::{Storage, StorageResult, StorageTx};
use crate::error::StorageError;
use crate::models::{
    Event, NewNotificationRecord, NewReservation, NotificationRecord, Reservation,
    ReservationStatus, Seat, SeatStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Seat(i64),
    Reservation(i64),
}

#[derive(Default)]
struct Tables {
    events: HashMap<i64, Event>,
    seats: BTreeMap<i64, Seat>,
    reservations: BTreeMap<i64, Reservation>,
    notifications: Vec<NotificationRecord>,
    next_event_id: i64,
    next_seat_id: i64,
    next_reservation_id: i64,
    next_notification_id: i64,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    offline: AtomicBool,
    failing_commits: AtomicUsize,
    panic_on_commit: AtomicBool,
    commit_delay_ms: AtomicU64,
}

impl Inner {
    // Паника в тесте не должна ломать остальные обращения
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, key: RowKey) -> Arc<RowMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }

    // Запись из карты убирается, когда на мьютекс больше никто не ссылается:
    // ни держатель, ни ожидающие (они клонируют Arc под тем же замком карты)
    fn release_rows(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage is offline".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_event(&self, stadium_id: i64, start_time: DateTime<Utc>) -> Event {
        let mut tables = self.inner.tables();
        tables.next_event_id += 1;
        let event = Event {
            id: tables.next_event_id,
            stadium_id,
            start_time,
        };
        tables.events.insert(event.id, event.clone());
        event
    }

    pub fn insert_seat(&self, stadium_id: i64) -> Seat {
        let mut tables = self.inner.tables();
        tables.next_seat_id += 1;
        let seat = Seat {
            id: tables.next_seat_id,
            stadium_id,
            status: SeatStatus::Available,
        };
        tables.seats.insert(seat.id, seat.clone());
        seat
    }

    // Снимки состояния для проверок, без блокировок строк

    pub fn seat(&self, id: i64) -> Option<Seat> {
        self.inner.tables().seats.get(&id).cloned()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.inner.tables().reservations.values().cloned().collect()
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.inner.tables().notifications.clone()
    }

    #[cfg(test)]
    fn tracked_row_locks(&self) -> usize {
        self.inner.row_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Следующие `count` фиксаций завершатся конфликтом записи.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn set_commit_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.commit_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Следующая фиксация запаникует, как сломанный драйвер.
    pub fn panic_on_next_commit(&self) {
        self.inner.panic_on_commit.store(true, Ordering::SeqCst);
    }

    /// Имитация упавшей БД: любые чтения и новые транзакции возвращают ошибку.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Tx = MemoryTx;

    async fn get_event(&self, id: i64) -> StorageResult<Option<Event>> {
        self.inner.ensure_online()?;
        Ok(self.inner.tables().events.get(&id).cloned())
    }

    async fn get_seat(&self, id: i64) -> StorageResult<Option<Seat>> {
        self.inner.ensure_online()?;
        Ok(self.inner.tables().seats.get(&id).cloned())
    }

    async fn get_reservation(&self, id: i64) -> StorageResult<Option<Reservation>> {
        self.inner.ensure_online()?;
        Ok(self.inner.tables().reservations.get(&id).cloned())
    }

    async fn begin(&self) -> StorageResult<MemoryTx> {
        self.inner.ensure_online()?;
        Ok(MemoryTx {
            inner: self.inner.clone(),
            held: HashSet::new(),
            guards: Vec::new(),
            writes: Vec::new(),
        })
    }

    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<i64>> {
        self.inner.ensure_online()?;
        Ok(self
            .inner
            .tables()
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.created_at < older_than)
            .map(|r| r.id)
            .collect())
    }
}

enum Write {
    SeatStatus(i64, SeatStatus),
    ReservationStatus(i64, ReservationStatus),
    InsertReservation(Reservation),
    InsertNotification(NotificationRecord),
}

/// Транзакция над [`MemoryStorage`]. Блокировки строк отпускаются при drop.
pub struct MemoryTx {
    inner: Arc<Inner>,
    held: HashSet<RowKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    writes: Vec<Write>,
}

impl MemoryTx {
    async fn lock_row(&mut self, key: RowKey) {
        if self.held.contains(&key) {
            return;
        }
        let lock = self.inner.row_lock(key);
        let guard = lock.lock_owned().await;
        self.held.insert(key);
        self.guards.push(guard);
    }

    // Свои незафиксированные записи видны внутри транзакции
    fn own_seat_status(&self, id: i64) -> Option<SeatStatus> {
        self.writes.iter().rev().find_map(|w| match w {
            Write::SeatStatus(seat_id, status) if *seat_id == id => Some(*status),
            _ => None,
        })
    }

    fn own_reservation(&self, id: i64) -> Option<Reservation> {
        self.writes.iter().find_map(|w| match w {
            Write::InsertReservation(r) if r.id == id => Some(r.clone()),
            _ => None,
        })
    }

    fn own_reservation_status(&self, id: i64) -> Option<ReservationStatus> {
        self.writes.iter().rev().find_map(|w| match w {
            Write::ReservationStatus(reservation_id, status) if *reservation_id == id => {
                Some(*status)
            }
            _ => None,
        })
    }

    fn apply(tables: &mut Tables, writes: Vec<Write>) -> StorageResult<()> {
        // Проверка уникальности до применения, чтобы commit был атомарным
        for write in &writes {
            if let Write::InsertReservation(new) = write {
                let taken = tables
                    .reservations
                    .values()
                    .any(|r| r.seat_id == new.seat_id && r.status.is_live());
                if taken && new.status.is_live() {
                    return Err(StorageError::Conflict(format!(
                        "seat {} already has a live reservation",
                        new.seat_id
                    )));
                }
            }
        }

        for write in writes {
            match write {
                Write::SeatStatus(id, status) => {
                    if let Some(seat) = tables.seats.get_mut(&id) {
                        seat.status = status;
                    }
                }
                Write::ReservationStatus(id, status) => {
                    if let Some(reservation) = tables.reservations.get_mut(&id) {
                        reservation.status = status;
                    }
                }
                Write::InsertReservation(reservation) => {
                    tables.reservations.insert(reservation.id, reservation);
                }
                Write::InsertNotification(record) => {
                    tables.notifications.push(record);
                }
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.guards.clear();
        self.inner.release_rows(self.held.drain());
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn get_seat_for_update(&mut self, id: i64) -> StorageResult<Option<Seat>> {
        self.lock_row(RowKey::Seat(id)).await;
        let seat = self.inner.tables().seats.get(&id).cloned();
        Ok(seat.map(|mut seat| {
            if let Some(status) = self.own_seat_status(id) {
                seat.status = status;
            }
            seat
        }))
    }

    async fn get_reservation_for_update(&mut self, id: i64) -> StorageResult<Option<Reservation>> {
        self.lock_row(RowKey::Reservation(id)).await;
        let stored = self.inner.tables().reservations.get(&id).cloned();
        let reservation = stored.or_else(|| self.own_reservation(id));
        Ok(reservation.map(|mut r| {
            if let Some(status) = self.own_reservation_status(id) {
                r.status = status;
            }
            r
        }))
    }

    async fn set_seat_status(&mut self, id: i64, status: SeatStatus) -> StorageResult<()> {
        if !self.inner.tables().seats.contains_key(&id) {
            return Err(StorageError::Database(sqlx::Error::RowNotFound));
        }
        self.lock_row(RowKey::Seat(id)).await;
        self.writes.push(Write::SeatStatus(id, status));
        Ok(())
    }

    async fn create_reservation(&mut self, new: NewReservation) -> StorageResult<Reservation> {
        // id выдается сразу, как последовательность: после отката остается дыра
        let id = {
            let mut tables = self.inner.tables();
            tables.next_reservation_id += 1;
            tables.next_reservation_id
        };
        let reservation = Reservation {
            id,
            user_id: new.user_id,
            seat_id: new.seat_id,
            stadium_id: new.stadium_id,
            status: new.status,
            created_at: Utc::now(),
        };
        self.lock_row(RowKey::Reservation(id)).await;
        self.writes.push(Write::InsertReservation(reservation.clone()));
        Ok(reservation)
    }

    async fn set_reservation_status(
        &mut self,
        id: i64,
        status: ReservationStatus,
    ) -> StorageResult<()> {
        let exists = self.inner.tables().reservations.contains_key(&id)
            || self.own_reservation(id).is_some();
        if !exists {
            return Err(StorageError::Database(sqlx::Error::RowNotFound));
        }
        self.lock_row(RowKey::Reservation(id)).await;
        self.writes.push(Write::ReservationStatus(id, status));
        Ok(())
    }

    async fn create_notification_record(
        &mut self,
        record: NewNotificationRecord,
    ) -> StorageResult<NotificationRecord> {
        self.inner.ensure_online()?;
        let id = {
            let mut tables = self.inner.tables();
            tables.next_notification_id += 1;
            tables.next_notification_id
        };
        let record = NotificationRecord {
            id,
            reservation_id: record.reservation_id,
            kind: record.kind.as_str().to_string(),
            message: record.message,
            created_at: Utc::now(),
        };
        self.writes.push(Write::InsertNotification(record.clone()));
        Ok(record)
    }

    async fn commit(mut self) -> StorageResult<()> {
        let delay = self.inner.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.inner.ensure_online()?;

        let forced_conflict = self
            .inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced_conflict {
            return Err(StorageError::Conflict("injected commit conflict".into()));
        }

        if self.inner.panic_on_commit.swap(false, Ordering::SeqCst) {
            panic!("memory storage commit panicked");
        }

        // Блокировки строк снимаются в drop, уже после применения записей
        let writes = std::mem::take(&mut self.writes);
        let mut tables = self.inner.tables();
        MemoryTx::apply(&mut tables, writes)
    }

    async fn rollback(self) -> StorageResult<()> {
        // Записи просто выбрасываются, блокировки уходят вместе с self
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);

        let mut tx = storage.begin().await.unwrap();
        tx.set_seat_status(seat.id, SeatStatus::Held).await.unwrap();
        assert_eq!(storage.seat(seat.id).unwrap().status, SeatStatus::Available);

        let locked = tx.get_seat_for_update(seat.id).await.unwrap().unwrap();
        assert_eq!(locked.status, SeatStatus::Held);

        tx.commit().await.unwrap();
        assert_eq!(storage.seat(seat.id).unwrap().status, SeatStatus::Held);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);

        let mut tx = storage.begin().await.unwrap();
        tx.set_seat_status(seat.id, SeatStatus::Held).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(storage.seat(seat.id).unwrap().status, SeatStatus::Available);
    }

    #[tokio::test]
    async fn row_lock_blocks_second_transaction_until_release() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);

        let mut first = storage.begin().await.unwrap();
        first.get_seat_for_update(seat.id).await.unwrap();

        let contender = {
            let storage = storage.clone();
            tokio::spawn(async move {
                let mut second = storage.begin().await.unwrap();
                second.get_seat_for_update(seat.id).await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.set_seat_status(seat.id, SeatStatus::Held).await.unwrap();
        first.commit().await.unwrap();

        let seen = contender.await.unwrap().unwrap();
        assert_eq!(seen.status, SeatStatus::Held);
    }

    #[tokio::test]
    async fn row_lock_entries_are_dropped_once_nobody_waits() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);

        let mut first = storage.begin().await.unwrap();
        first.get_seat_for_update(seat.id).await.unwrap();
        let waiter = {
            let storage = storage.clone();
            tokio::spawn(async move {
                let mut second = storage.begin().await.unwrap();
                second.get_seat_for_update(seat.id).await.unwrap();
                second.rollback().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Ожидающий держит ссылку: запись должна пережить commit первого
        first.commit().await.unwrap();
        waiter.await.unwrap();
        assert_eq!(storage.tracked_row_locks(), 0);

        for _ in 0..10 {
            let mut tx = storage.begin().await.unwrap();
            tx.get_seat_for_update(seat.id).await.unwrap();
            tx.set_seat_status(seat.id, SeatStatus::Held).await.unwrap();
            tx.rollback().await.unwrap();
        }
        assert_eq!(storage.tracked_row_locks(), 0);
    }

    #[tokio::test]
    async fn second_live_reservation_on_seat_conflicts_at_commit() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);
        let new = NewReservation {
            user_id: 1,
            seat_id: seat.id,
            stadium_id: 1,
            status: ReservationStatus::Pending,
        };

        let mut tx = storage.begin().await.unwrap();
        tx.create_reservation(new.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.create_reservation(new).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(storage.reservations().len(), 1);
    }

    #[tokio::test]
    async fn injected_conflict_fails_only_requested_commits() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);
        storage.fail_next_commits(1);

        let mut tx = storage.begin().await.unwrap();
        tx.set_seat_status(seat.id, SeatStatus::Held).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_conflict());

        let mut tx = storage.begin().await.unwrap();
        tx.set_seat_status(seat.id, SeatStatus::Held).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(storage.seat(seat.id).unwrap().status, SeatStatus::Held);
    }

    #[tokio::test]
    async fn stale_pending_lists_only_old_pending_reservations() {
        let storage = MemoryStorage::new();
        let seat = storage.insert_seat(1);

        let mut tx = storage.begin().await.unwrap();
        let reservation = tx
            .create_reservation(NewReservation {
                user_id: 1,
                seat_id: seat.id,
                stadium_id: 1,
                status: ReservationStatus::Pending,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let past = Utc::now() - ChronoDuration::hours(1);
        assert!(storage.list_stale_pending(past).await.unwrap().is_empty());

        let future = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(
            storage.list_stale_pending(future).await.unwrap(),
            vec![reservation.id]
        );
    }

    #[tokio::test]
    async fn offline_storage_rejects_reads_and_transactions() {
        let storage = MemoryStorage::new();
        storage.set_offline(true);

        assert!(matches!(
            storage.get_seat(1).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(storage.begin().await.is_err());
    }
}
