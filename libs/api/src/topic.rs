use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{Ack, LogError, LogQuery, OverflowPolicy, RawRecord};

/// Boxed future, возвращаемый методами log-трейтов.
pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LogError>> + Send + 'a>>;

// ════════════════════════════════════════════════════════════════
//  Storage
// ════════════════════════════════════════════════════════════════

/// Фабрика для создания LogStorage по JSON-конфигу.
///
/// Один экземпляр storage на партицию topic'а. Реализации:
/// MemoryStorageFactory, FileStorageFactory.
pub trait StorageFactory: Send + Sync {
    fn create(
        &self,
        topic: &str,
        partition: u32,
        config_json: &str,
    ) -> Result<Arc<dyn LogStorage>, LogError>;
}

/// Storage backend одной партиции. Хранит записи в порядке offset'ов.
pub trait LogStorage: Send + Sync {
    /// Инициализация (создание директорий, восстановление с диска).
    /// Возвращает следующий свободный offset партиции.
    fn init(&self) -> LogFuture<'_, u64>;

    /// Дописать записи. Offset'ы уже назначены topic'ом и идут подряд.
    fn append(&self, records: &[RawRecord]) -> LogFuture<'_, ()>;

    /// Прочитать записи начиная с `from_offset` (inclusive).
    /// Если начало уже вытеснено retention'ом — с самого раннего доступного.
    fn read(&self, from_offset: u64, limit: Option<usize>) -> LogFuture<'_, Vec<RawRecord>>;

    /// Flush буферов на диск.
    fn flush(&self) -> LogFuture<'_, ()>;
}

// ════════════════════════════════════════════════════════════════
//  Publish / Subscribe
// ════════════════════════════════════════════════════════════════

/// Подписка на партицию — ленивый бесконечный поток записей.
///
/// Реализуется server-side (MpscSubscription). API crate определяет
/// только трейт, без зависимости от tokio.
pub trait LogSubscription: Send {
    /// Получить следующую запись. None = topic закрыт / подписка отменена.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<RawRecord>> + Send + '_>>;
}

/// Публикация записей в topic (append → notify subscribers).
pub trait LogPublisher: Send + Sync {
    /// Опубликовать payload. Партиция выбирается по хешу ключа.
    fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> LogFuture<'_, Ack>;
}

/// Подписка на партицию topic'а с заданного offset'а.
pub trait LogSubscriber: Send + Sync {
    /// Сначала отдаются сохранённые записи начиная с `from_offset`,
    /// затем live-записи без пропусков и повторов.
    ///
    /// - `buffer`: размер буфера live-канала
    /// - `overflow`: стратегия при переполнении (Drop или BackPressure)
    fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        buffer: usize,
        overflow: OverflowPolicy,
    ) -> LogFuture<'_, Box<dyn LogSubscription>>;

    /// Следующий offset, который получит партиция (0 — партиция пуста).
    fn end_offset(&self, topic: &str, partition: u32) -> LogFuture<'_, u64>;
}

/// Чтение, метаданные и управление topic'ами.
pub trait LogInspector: Send + Sync {
    /// Прочитать записи из storage topic'а.
    fn query(&self, topic: &str, query: &LogQuery) -> LogFuture<'_, Vec<RawRecord>>;

    /// Список всех доступных topic'ов.
    fn topics(&self) -> Vec<String>;

    /// Количество партиций topic'а. None — topic не найден.
    fn partitions(&self, topic: &str) -> Option<u32>;

    /// Flush storage конкретного topic'а.
    fn flush_topic(&self, topic: &str) -> LogFuture<'_, ()>;
}
