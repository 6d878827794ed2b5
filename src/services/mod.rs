pub mod critical_section;
pub mod expiry;
pub mod notifications;
pub mod reservations;

pub use critical_section::CriticalSection;
pub use expiry::ExpirySweeper;
pub use notifications::{NotificationDispatcher, NotificationStats, ShutdownOutcome};
pub use reservations::ReservationManager;
