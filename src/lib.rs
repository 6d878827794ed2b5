pub mod config;
pub mod database;
pub mod redis_client;
pub mod models;
pub mod error;
pub mod storage;
pub mod services;
pub mod controllers;
pub mod cache;

use std::sync::Arc;

use cache::ReservationCache;
use services::{CriticalSection, NotificationDispatcher, ReservationManager};
use storage::Storage;

// Shared state для всего приложения
pub struct AppState<S: Storage> {
    pub reservations: ReservationManager<S>,
    pub cache: Option<ReservationCache>,
}

impl<S: Storage> AppState<S> {
    /// Собирает менеджер броней поверх хранилища и запускает воркер уведомлений.
    pub fn new(storage: Arc<S>, cache: Option<ReservationCache>) -> Arc<Self> {
        let notifications = Arc::new(NotificationDispatcher::start(storage.clone()));
        let reservations =
            ReservationManager::new(storage, Arc::new(CriticalSection::new()), notifications);
        Arc::new(Self {
            reservations,
            cache,
        })
    }
}
