use thiserror::Error;

/// Ошибки слоя хранения.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Проигранная гонка записи: конфликт сериализации, дедлок, нарушение
    /// уникальности или таймаут на блокировке.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Ошибки проверки запроса, найденные до входа в критическую секцию.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event {0} not found")]
    EventNotFound(i64),

    #[error("event {0} has already started")]
    EventNotActive(i64),

    #[error("seat {0} not found")]
    SeatNotFound(i64),

    #[error("seat {seat_id} does not belong to stadium {stadium_id}")]
    SeatWrongStadium { seat_id: i64, stadium_id: i64 },
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("seat {0} is not available")]
    SeatUnavailable(i64),

    #[error("concurrent modification, retry the operation")]
    ConcurrencyConflict,

    #[error("reservation {0} not found")]
    NotFound(i64),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl ReservationError {
    /// Конфликт записи внутри транзакции (включая commit) превращается в
    /// ConcurrencyConflict, остальное остается StorageFailure.
    pub fn from_write(err: StorageError) -> Self {
        if err.is_conflict() {
            ReservationError::ConcurrencyConflict
        } else {
            ReservationError::Storage(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_conflict_maps_to_concurrency_conflict() {
        let err = ReservationError::from_write(StorageError::Conflict("40001".into()));
        assert!(matches!(err, ReservationError::ConcurrencyConflict));

        let err = ReservationError::from_write(StorageError::Unavailable("down".into()));
        assert!(matches!(err, ReservationError::Storage(_)));
    }

    #[test]
    fn validation_errors_surface_verbatim() {
        let err: ReservationError = ValidationError::EventNotActive(4).into();
        assert_eq!(err.to_string(), "event 4 has already started");
    }
}
