//! Менеджер броней: Reserve / Get / Cancel / Approve / Expire.
//!
//! Протокол для всех изменяющих операций одинаковый: предварительные проверки
//! без блокировок -> критическая секция процесса -> транзакция, перечитывание
//! строки с `FOR UPDATE`, окончательная проверка, запись, commit -> событие в
//! очередь уведомлений (строго после commit, вне атомарности транзакции).
//!
//! Переходы места: Available -> Held (успешный Reserve) и Held -> Available
//! (успешный Cancel или Expire). Других переходов нет.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::critical_section::CriticalSection;
use super::notifications::NotificationDispatcher;
use crate::error::{ReservationError, ValidationError};
use crate::models::{
    Event, NewReservation, NotificationKind, Reservation, ReservationEvent, ReservationStatus,
    SeatStatus,
};
use crate::storage::{Storage, StorageTx};

type ReservationResult<T> = Result<T, ReservationError>;

// Какие брони может снять операция освобождения места
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Cancel,
    Expire,
}

impl Release {
    fn applies_to(self, status: ReservationStatus) -> bool {
        match self {
            Release::Cancel => status.is_live(),
            Release::Expire => status == ReservationStatus::Pending,
        }
    }

    fn kind(self) -> NotificationKind {
        match self {
            Release::Cancel => NotificationKind::ReservationCancelled,
            Release::Expire => NotificationKind::ReservationExpired,
        }
    }
}

pub struct ReservationManager<S: Storage> {
    storage: Arc<S>,
    critical: Arc<CriticalSection>,
    notifications: Arc<NotificationDispatcher>,
}

impl<S: Storage> Clone for ReservationManager<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            critical: self.critical.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

impl<S: Storage> ReservationManager<S> {
    pub fn new(
        storage: Arc<S>,
        critical: Arc<CriticalSection>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            storage,
            critical,
            notifications,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.notifications
    }

    /// Захватывает место `seat_id` на событие `event_id` для пользователя.
    pub async fn reserve(
        &self,
        event_id: i64,
        seat_id: i64,
        user_id: i64,
    ) -> ReservationResult<Reservation> {
        let event = self
            .storage
            .get_event(event_id)
            .await?
            .ok_or(ValidationError::EventNotFound(event_id))?;
        if !event.is_active_at(Utc::now()) {
            return Err(ValidationError::EventNotActive(event_id).into());
        }

        let seat = self
            .storage
            .get_seat(seat_id)
            .await?
            .ok_or(ValidationError::SeatNotFound(seat_id))?;
        if seat.stadium_id != event.stadium_id {
            return Err(ValidationError::SeatWrongStadium {
                seat_id,
                stadium_id: event.stadium_id,
            }
            .into());
        }
        // Только чтобы быстро отказать: это чтение не видит параллельных транзакций
        if !seat.is_available() {
            return Err(ReservationError::SeatUnavailable(seat_id));
        }

        let reservation = self
            .critical
            .execute_exclusive(|| async {
                let mut tx = self.storage.begin().await?;
                let result = Self::reserve_in_tx(&mut tx, &event, seat_id, user_id).await;
                Self::finish(tx, result).await
            })
            .await?
            .ok_or(ReservationError::SeatUnavailable(seat_id))?;

        info!(
            reservation_id = reservation.id,
            event_id,
            seat_id,
            user_id,
            "seat reserved"
        );
        self.notifications.push(
            ReservationEvent::new(reservation.id, NotificationKind::ReservationCreated)
                .with_detail(format!(
                    "reservation {} created for seat {} (event {})",
                    reservation.id, seat_id, event_id
                )),
        );
        Ok(reservation)
    }

    async fn reserve_in_tx(
        tx: &mut S::Tx,
        event: &Event,
        seat_id: i64,
        user_id: i64,
    ) -> ReservationResult<Option<Reservation>> {
        // Авторитетная проверка под блокировкой строки
        let seat = tx
            .get_seat_for_update(seat_id)
            .await
            .map_err(ReservationError::from_write)?
            .ok_or(ValidationError::SeatNotFound(seat_id))?;

        if seat.stadium_id != event.stadium_id {
            return Err(ValidationError::SeatWrongStadium {
                seat_id,
                stadium_id: event.stadium_id,
            }
            .into());
        }
        if !seat.is_available() {
            return Err(ReservationError::SeatUnavailable(seat_id));
        }

        tx.set_seat_status(seat_id, SeatStatus::Held)
            .await
            .map_err(ReservationError::from_write)?;
        let reservation = tx
            .create_reservation(NewReservation {
                user_id,
                seat_id,
                stadium_id: seat.stadium_id,
                status: ReservationStatus::Pending,
            })
            .await
            .map_err(ReservationError::from_write)?;

        Ok(Some(reservation))
    }

    pub async fn get(&self, reservation_id: i64) -> ReservationResult<Reservation> {
        self.storage
            .get_reservation(reservation_id)
            .await?
            .ok_or(ReservationError::NotFound(reservation_id))
    }

    /// Отменяет живую бронь и освобождает место. `false` - брони нет или она
    /// уже отменена; в этом случае ничего не меняется.
    pub async fn cancel(&self, reservation_id: i64) -> ReservationResult<bool> {
        self.release(reservation_id, Release::Cancel).await
    }

    /// Истечение неоплаченной брони: только из Pending, место освобождается
    /// так же, как при отмене, иначе Held-место осталось бы без живой брони.
    pub async fn expire(&self, reservation_id: i64) -> ReservationResult<bool> {
        self.release(reservation_id, Release::Expire).await
    }

    async fn release(&self, reservation_id: i64, release: Release) -> ReservationResult<bool> {
        let released = self
            .critical
            .execute_exclusive(|| async {
                let mut tx = self.storage.begin().await?;
                let result = Self::release_in_tx(&mut tx, reservation_id, release).await;
                Self::finish(tx, result).await
            })
            .await?;

        let Some(reservation) = released else {
            return Ok(false);
        };

        info!(
            reservation_id,
            seat_id = reservation.seat_id,
            reason = ?release,
            "reservation released"
        );
        self.notifications.push(
            ReservationEvent::new(reservation_id, release.kind()).with_detail(format!(
                "reservation {} released seat {}",
                reservation_id, reservation.seat_id
            )),
        );
        Ok(true)
    }

    async fn release_in_tx(
        tx: &mut S::Tx,
        reservation_id: i64,
        release: Release,
    ) -> ReservationResult<Option<Reservation>> {
        let Some(mut reservation) = tx
            .get_reservation_for_update(reservation_id)
            .await
            .map_err(ReservationError::from_write)?
        else {
            return Ok(None);
        };
        // Перечитанный статус уже не тот, что ожидает операция (например, повторная отмена)
        if !release.applies_to(reservation.status) {
            return Ok(None);
        }

        tx.set_reservation_status(reservation_id, ReservationStatus::Cancelled)
            .await
            .map_err(ReservationError::from_write)?;
        tx.get_seat_for_update(reservation.seat_id)
            .await
            .map_err(ReservationError::from_write)?;
        tx.set_seat_status(reservation.seat_id, SeatStatus::Available)
            .await
            .map_err(ReservationError::from_write)?;

        reservation.status = ReservationStatus::Cancelled;
        Ok(Some(reservation))
    }

    /// Подтверждение брони внешней стороной: Pending -> Approved, место остается Held.
    pub async fn approve(&self, reservation_id: i64) -> ReservationResult<bool> {
        let approved = self
            .critical
            .execute_exclusive(|| async {
                let mut tx = self.storage.begin().await?;
                let result = Self::approve_in_tx(&mut tx, reservation_id).await;
                Self::finish(tx, result).await
            })
            .await?;

        if approved.is_none() {
            return Ok(false);
        }

        info!(reservation_id, "reservation approved");
        self.notifications.push(ReservationEvent::new(
            reservation_id,
            NotificationKind::ReservationApproved,
        ));
        Ok(true)
    }

    async fn approve_in_tx(
        tx: &mut S::Tx,
        reservation_id: i64,
    ) -> ReservationResult<Option<Reservation>> {
        let Some(mut reservation) = tx
            .get_reservation_for_update(reservation_id)
            .await
            .map_err(ReservationError::from_write)?
        else {
            return Ok(None);
        };
        if reservation.status != ReservationStatus::Pending {
            return Ok(None);
        }

        tx.set_reservation_status(reservation_id, ReservationStatus::Approved)
            .await
            .map_err(ReservationError::from_write)?;
        reservation.status = ReservationStatus::Approved;
        Ok(Some(reservation))
    }

    // Some -> commit, None или ошибка -> откат. Ошибка commit - ConcurrencyConflict
    // для проигранной гонки, иначе StorageFailure.
    async fn finish<T: Send>(
        tx: S::Tx,
        result: ReservationResult<Option<T>>,
    ) -> ReservationResult<Option<T>> {
        match result {
            Ok(Some(value)) => {
                tx.commit().await.map_err(|e| {
                    warn!("commit failed: {:?}", e);
                    ReservationError::from_write(e)
                })?;
                Ok(Some(value))
            }
            other => {
                if let Err(e) = tx.rollback().await {
                    warn!("rollback failed: {:?}", e);
                }
                other
            }
        }
    }
}
