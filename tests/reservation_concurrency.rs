mod common;

use futures::future::join_all;
use seat_reservation::error::ReservationError;
use seat_reservation::models::{ReservationStatus, SeatStatus};
use seat_reservation::services::{CriticalSection, NotificationDispatcher, ReservationManager};
use std::sync::Arc;
use std::time::Duration;

use common::{instance, wait_for_notifications, world};

fn assert_lost_race(result: &Result<seat_reservation::models::Reservation, ReservationError>) {
    assert!(
        matches!(
            result,
            Err(ReservationError::SeatUnavailable(_)) | Err(ReservationError::ConcurrencyConflict)
        ),
        "unexpected result: {:?}",
        result
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_on_one_seat_have_a_single_winner() {
    let w = world();
    let manager = instance(&w.storage);

    let attempts = (1..=32).map(|user_id| {
        let manager = manager.clone();
        let (event_id, seat_id) = (w.event.id, w.seat.id);
        tokio::spawn(async move { manager.reserve(event_id, seat_id, user_id).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    results.iter().filter(|r| r.is_err()).for_each(assert_lost_race);

    let live: Vec<_> = w
        .storage
        .reservations()
        .into_iter()
        .filter(|r| r.seat_id == w.seat.id && r.status.is_live())
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(w.storage.seat(w.seat.id).unwrap().status, SeatStatus::Held);
}

// Несколько "процессов" с собственными мьютексами: исключение держится на блокировке строки
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn row_lock_alone_prevents_double_booking_across_instances() {
    let w = world();
    w.storage.set_commit_delay(Duration::from_millis(20));
    let instances: Vec<_> = (0..8).map(|_| instance(&w.storage)).collect();

    let attempts = instances.iter().enumerate().map(|(i, manager)| {
        let manager = manager.clone();
        let (event_id, seat_id) = (w.event.id, w.seat.id);
        tokio::spawn(async move { manager.reserve(event_id, seat_id, i as i64 + 1).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    results.iter().filter(|r| r.is_err()).for_each(assert_lost_race);
    assert_eq!(
        w.storage
            .reservations()
            .iter()
            .filter(|r| r.status.is_live())
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reserve_cancel_scenario_emits_one_cancellation_notice() {
    let w = world();
    let storage = w.storage.clone();
    let manager = ReservationManager::new(
        storage.clone(),
        Arc::new(CriticalSection::new()),
        Arc::new(NotificationDispatcher::start(storage.clone())),
    );

    // Первая транзакция медленно фиксируется, вторая попытка приходит до commit
    storage.set_commit_delay(Duration::from_millis(100));
    let first = {
        let manager = manager.clone();
        let (event_id, seat_id) = (w.event.id, w.seat.id);
        tokio::spawn(async move { manager.reserve(event_id, seat_id, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = manager.reserve(w.event.id, w.seat.id, 2).await;
    let r1 = first.await.unwrap().unwrap();
    storage.set_commit_delay(Duration::ZERO);

    assert_lost_race(&second);
    assert_eq!(r1.status, ReservationStatus::Pending);
    assert_eq!(storage.seat(w.seat.id).unwrap().status, SeatStatus::Held);

    assert!(manager.cancel(r1.id).await.unwrap());
    assert_eq!(
        manager.get(r1.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    assert_eq!(storage.seat(w.seat.id).unwrap().status, SeatStatus::Available);

    let records = wait_for_notifications(&storage, |records| {
        records.iter().any(|n| n.kind == "ReservationCancelled")
    })
    .await;
    let cancellations: Vec<_> = records
        .iter()
        .filter(|n| n.kind == "ReservationCancelled")
        .collect();
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].reservation_id, r1.id);
}

#[tokio::test]
async fn concurrent_double_cancel_releases_exactly_once() {
    let w = world();
    let manager = instance(&w.storage);
    let reservation = manager.reserve(w.event.id, w.seat.id, 1).await.unwrap();

    let (a, b) = tokio::join!(manager.cancel(reservation.id), manager.cancel(reservation.id));
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|cancelled| **cancelled).count(), 1);

    wait_for_notifications(&w.storage, |records| {
        records.iter().any(|n| n.kind == "ReservationCancelled")
    })
    .await;
    // Дать воркеру шанс записать возможный дубль
    tokio::time::sleep(Duration::from_millis(30)).await;
    let cancellations = w
        .storage
        .notifications()
        .into_iter()
        .filter(|n| n.kind == "ReservationCancelled")
        .count();
    assert_eq!(cancellations, 1);
}
