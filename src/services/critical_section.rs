use std::future::Future;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

/// Сериализует операции, меняющие брони, в пределах одного процесса.
///
/// Это только оптимизация: внутри процесса конкурирующие транзакции не бьются
/// за одну строку зря. Между экземплярами сервиса исключение дает блокировка
/// строки в БД, которую `work` берет сам. Очередь ожидания у tokio::sync::Mutex
/// FIFO, но никакой справедливости сверх "рано или поздно выполнится" не обещаем.
#[derive(Debug, Default)]
pub struct CriticalSection {
    lock: Mutex<()>,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Выполняет `work` эксклюзивно. Захват снимается при возврате, ошибке,
    /// панике или отмене (drop) возвращенного future.
    pub async fn execute_exclusive<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let waiting_since = Instant::now();
        let _guard = self.lock.lock().await;
        debug!(
            waited_ms = waiting_since.elapsed().as_millis() as u64,
            "entered critical section"
        );
        work().await
    }

    #[cfg(test)]
    fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
