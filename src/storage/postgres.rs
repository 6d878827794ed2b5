use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use std::time::Duration;

use super::{Storage, StorageResult, StorageTx};
use crate::database::Database;
use crate::error::StorageError;
use crate::models::{
    Event, NewNotificationRecord, NewReservation, NotificationRecord, Reservation,
    ReservationStatus, Seat, SeatStatus,
};

// SQLSTATE, при которых транзакция проиграла гонку
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

const RESERVATION_COLUMNS: &str = "id, user_id, seat_id, stadium_id, status, created_at";

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let conflict = match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|code| code.into_owned());
            let lost_race = db_err.is_unique_violation()
                || matches!(
                    code.as_deref(),
                    Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE)
                );
            lost_race.then(|| db_err.message().to_string())
        }
        sqlx::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
            Some(io_err.to_string())
        }
        _ => None,
    };

    match (conflict, err) {
        (Some(message), _) => StorageError::Conflict(message),
        (None, sqlx::Error::PoolTimedOut) => {
            StorageError::Unavailable("connection pool timed out".into())
        }
        (None, err) => StorageError::Database(err),
    }
}

#[derive(Clone)]
pub struct PgStorage {
    db: Database,
    lock_timeout: Duration,
}

impl PgStorage {
    pub fn new(db: Database, lock_timeout: Duration) -> Self {
        Self { db, lock_timeout }
    }
}

#[async_trait]
impl Storage for PgStorage {
    type Tx = PgTx;

    async fn get_event(&self, id: i64) -> StorageResult<Option<Event>> {
        sqlx::query_as::<_, Event>("SELECT id, stadium_id, start_time FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_seat(&self, id: i64) -> StorageResult<Option<Seat>> {
        sqlx::query_as::<_, Seat>("SELECT id, stadium_id, status FROM seats WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_reservation(&self, id: i64) -> StorageResult<Option<Reservation>> {
        sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn begin(&self) -> StorageResult<PgTx> {
        let mut tx = self.db.pool.begin().await.map_err(map_sqlx_error)?;

        // Зависшая блокировка строки должна закончиться 55P03, а не ждать вечно
        let lock_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&lock_timeout)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        Ok(PgTx { tx })
    }

    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM reservations WHERE status = $1 AND created_at < $2 ORDER BY id",
        )
        .bind(ReservationStatus::Pending)
        .bind(older_than)
        .fetch_all(&self.db.pool)
        .await
        .map_err(map_sqlx_error)
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PgTx {
    async fn get_seat_for_update(&mut self, id: i64) -> StorageResult<Option<Seat>> {
        sqlx::query_as::<_, Seat>(
            "SELECT id, stadium_id, status FROM seats WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)
    }

    async fn get_reservation_for_update(&mut self, id: i64) -> StorageResult<Option<Reservation>> {
        sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)
    }

    async fn set_seat_status(&mut self, id: i64, status: SeatStatus) -> StorageResult<()> {
        let result = sqlx::query("UPDATE seats SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn create_reservation(&mut self, new: NewReservation) -> StorageResult<Reservation> {
        sqlx::query_as::<_, Reservation>(&format!(
            "INSERT INTO reservations (user_id, seat_id, stadium_id, status)
             VALUES ($1, $2, $3, $4)
             RETURNING {RESERVATION_COLUMNS}"
        ))
        .bind(new.user_id)
        .bind(new.seat_id)
        .bind(new.stadium_id)
        .bind(new.status)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)
    }

    async fn set_reservation_status(
        &mut self,
        id: i64,
        status: ReservationStatus,
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE reservations SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn create_notification_record(
        &mut self,
        record: NewNotificationRecord,
    ) -> StorageResult<NotificationRecord> {
        sqlx::query_as::<_, NotificationRecord>(
            "INSERT INTO notifications (reservation_id, kind, message)
             VALUES ($1, $2, $3)
             RETURNING id, reservation_id, kind, message, created_at",
        )
        .bind(record.reservation_id)
        .bind(record.kind.as_str())
        .bind(record.message)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)
    }

    async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self) -> StorageResult<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
