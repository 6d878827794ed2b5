//! Хранилище мест, броней и уведомлений.
//!
//! Менеджер броней работает только через [`Storage`] и [`StorageTx`], поэтому
//! один и тот же код гоняется и на Postgres, и на [`MemoryStorage`] в тестах.
//! Корректность держится на блокировке строки внутри транзакции
//! (`get_seat_for_update`), а не на мьютексе процесса.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::models::{
    Event, NewNotificationRecord, NewReservation, NotificationRecord, Reservation,
    ReservationStatus, Seat, SeatStatus,
};

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Tx: StorageTx;

    // Чтения без блокировок: только для быстрой предварительной проверки
    async fn get_event(&self, id: i64) -> StorageResult<Option<Event>>;
    async fn get_seat(&self, id: i64) -> StorageResult<Option<Seat>>;
    async fn get_reservation(&self, id: i64) -> StorageResult<Option<Reservation>>;

    async fn begin(&self) -> StorageResult<Self::Tx>;

    /// Id броней в статусе Pending, созданных раньше `older_than`.
    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<i64>>;
}

/// Открытая транзакция. Блокировки строк держатся до `commit`/`rollback`
/// или до drop (drop без commit = откат).
#[async_trait]
pub trait StorageTx: Send {
    async fn get_seat_for_update(&mut self, id: i64) -> StorageResult<Option<Seat>>;
    async fn get_reservation_for_update(&mut self, id: i64) -> StorageResult<Option<Reservation>>;

    async fn set_seat_status(&mut self, id: i64, status: SeatStatus) -> StorageResult<()>;
    async fn create_reservation(&mut self, new: NewReservation) -> StorageResult<Reservation>;
    async fn set_reservation_status(
        &mut self,
        id: i64,
        status: ReservationStatus,
    ) -> StorageResult<()>;
    async fn create_notification_record(
        &mut self,
        record: NewNotificationRecord,
    ) -> StorageResult<NotificationRecord>;

    async fn commit(self) -> StorageResult<()>;
    async fn rollback(self) -> StorageResult<()>;
}
