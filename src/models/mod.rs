pub mod event;
pub mod seat;
pub mod reservation;
pub mod notification;

pub use event::Event;
pub use seat::{Seat, SeatStatus};
pub use reservation::{NewReservation, Reservation, ReservationStatus};
pub use notification::{
    NewNotificationRecord, NotificationKind, NotificationRecord, ReservationEvent,
};
