//! Очередь уведомлений о жизненном цикле броней.
//!
//! `push` только кладет событие в очередь и сразу возвращает управление.
//! Единственный фоновый воркер достает события по одному (FIFO), открывает
//! отдельную транзакцию и пишет `NotificationRecord`. Ошибки записи логируются
//! и теряются: доставка best-effort, без повторов и dead-letter.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::{NotificationRecord, ReservationEvent};
use crate::storage::{Storage, StorageResult, StorageTx};

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    persisted: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Снимок счетчиков диспетчера.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotificationStats {
    /// Принято в очередь, но еще не обработано воркером.
    pub pending: usize,
    pub persisted: u64,
    pub failed: u64,
    /// Отклонено после начала остановки.
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Очередь дочитана до конца в пределах grace-периода.
    Drained,
    /// Grace-период истек, воркер снят, оставшиеся события потеряны.
    Abandoned { pending: usize },
    /// Воркер упал (паника) раньше, чем дочитал очередь.
    WorkerFailed { pending: usize },
    AlreadyStopped,
}

pub struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<ReservationEvent>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl NotificationDispatcher {
    /// Запускает воркер. Нужен работающий tokio runtime.
    pub fn start<S: Storage>(storage: Arc<S>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let worker = tokio::spawn(run_worker(storage, receiver, shutdown_rx, counters.clone()));
        info!("Notification worker started");

        Self {
            sender,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// Никогда не блокирует и не возвращает ошибку: даже если БД лежит,
    /// событие просто потеряется позже в воркере.
    pub fn push(&self, event: ReservationEvent) {
        if !self.accepting.load(Ordering::SeqCst) {
            self.reject(&event);
            return;
        }

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event) {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.reject(&event);
        }
    }

    fn reject(&self, event: &ReservationEvent) {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        warn!(
            event_id = %event.event_id,
            reservation_id = event.reservation_id,
            kind = %event.kind,
            "notification dispatcher is shutting down, event dropped"
        );
    }

    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            pending: self.counters.pending.load(Ordering::SeqCst),
            persisted: self.counters.persisted.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
        }
    }

    /// Перестает принимать события, дает воркеру `grace` на то, чтобы
    /// дочитать очередь, иначе снимает его. Воркер, застрявший посреди записи,
    /// отменяется вместе с транзакцией (drop = откат), так что дедлока нет.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let Some(mut worker) = self.worker.lock().await.take() else {
            return ShutdownOutcome::AlreadyStopped;
        };

        match tokio::time::timeout(grace, &mut worker).await {
            Ok(Ok(())) => {
                info!("Notification queue drained");
                ShutdownOutcome::Drained
            }
            Ok(Err(e)) => {
                let pending = self.counters.pending.load(Ordering::SeqCst);
                error!(pending, "Notification worker crashed: {:?}", e);
                ShutdownOutcome::WorkerFailed { pending }
            }
            Err(_) => {
                worker.abort();
                let _ = worker.await;
                let pending = self.counters.pending.load(Ordering::SeqCst);
                warn!(pending, "Notification queue abandoned after grace period");
                ShutdownOutcome::Abandoned { pending }
            }
        }
    }
}

async fn run_worker<S: Storage>(
    storage: Arc<S>,
    mut receiver: mpsc::UnboundedReceiver<ReservationEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    loop {
        tokio::select! {
            biased;

            // Ошибка тут значит, что диспетчер уже уничтожен - тоже остановка
            _ = shutdown_rx.changed() => {
                receiver.close();
                while let Some(event) = receiver.recv().await {
                    handle_event(storage.as_ref(), event, &counters).await;
                }
                break;
            }
            next = receiver.recv() => match next {
                Some(event) => handle_event(storage.as_ref(), event, &counters).await,
                None => break,
            },
        }
    }
    info!("Notification worker stopped");
}

async fn handle_event<S: Storage>(storage: &S, event: ReservationEvent, counters: &Counters) {
    match persist(storage, &event).await {
        Ok(record) => {
            counters.persisted.fetch_add(1, Ordering::SeqCst);
            info!(
                notification_id = record.id,
                reservation_id = record.reservation_id,
                kind = %record.kind,
                "notification persisted"
            );
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            error!(
                event_id = %event.event_id,
                reservation_id = event.reservation_id,
                kind = %event.kind,
                "failed to persist notification: {:?}",
                e
            );
        }
    }
    counters.pending.fetch_sub(1, Ordering::SeqCst);
}

// Каждое уведомление - отдельная единица работы
async fn persist<S: Storage>(
    storage: &S,
    event: &ReservationEvent,
) -> StorageResult<NotificationRecord> {
    let mut tx = storage.begin().await?;
    let record = match tx.create_notification_record(event.into()).await {
        Ok(record) => record,
        Err(e) => {
            let _ = tx.rollback().await;
            return Err(e);
        }
    };
    tx.commit().await?;
    Ok(record)
}
