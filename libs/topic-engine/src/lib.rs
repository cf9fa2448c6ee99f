pub mod error;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use streamfold_api::{
    Ack, LogFuture, LogInspector, LogPublisher, LogQuery, LogStorage, LogSubscriber,
    LogSubscription, OverflowPolicy, RawRecord, now_ms,
};

pub use error::TopicError;

// ═══════════════════════════════════════════════════════════════
//  Subscriber
// ═══════════════════════════════════════════════════════════════

struct Subscriber {
    tx: mpsc::Sender<RawRecord>,
    overflow: OverflowPolicy,
}

// ═══════════════════════════════════════════════════════════════
//  MpscSubscription — server-side LogSubscription impl
// ═══════════════════════════════════════════════════════════════

/// Подписка на одну партицию: сначала backlog из storage,
/// затем live-записи из mpsc канала.
pub struct MpscSubscription {
    backlog: VecDeque<RawRecord>,
    rx: mpsc::Receiver<RawRecord>,
    /// Записи ниже этого offset'а пропускаются (подписка "из будущего").
    from_offset: u64,
}

impl LogSubscription for MpscSubscription {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<RawRecord>> + Send + '_>> {
        Box::pin(async move {
            if let Some(record) = self.backlog.pop_front() {
                return Some(record);
            }
            loop {
                let record = self.rx.recv().await?;
                if record.offset >= self.from_offset {
                    return Some(record);
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Partition
// ═══════════════════════════════════════════════════════════════

struct PartitionLog {
    next_offset: u64,
    subscribers: Vec<Subscriber>,
}

/// Партиция: storage + назначение offset'ов + live подписчики.
///
/// Один mutex на партицию: append, назначение offset'а и рассылка
/// идут под ним, поэтому подписчики видят записи строго по порядку,
/// а подписка (backlog + регистрация) не теряет и не дублирует записи.
struct Partition {
    storage: Arc<dyn LogStorage>,
    log: Mutex<PartitionLog>,
}

// ═══════════════════════════════════════════════════════════════
//  Topic
// ═══════════════════════════════════════════════════════════════

/// Именованный партиционированный лог.
///
/// Запись попадает в партицию по хешу ключа; внутри партиции offset'ы
/// плотные и начинаются с 0.
pub struct Topic {
    pub name: String,
    partitions: Vec<Partition>,
}

impl Topic {
    /// Создать topic: по одному storage на партицию.
    pub fn new(name: String, storages: Vec<Arc<dyn LogStorage>>) -> Result<Self, TopicError> {
        if storages.is_empty() {
            return Err(TopicError::NoPartitions(name));
        }
        let partitions = storages
            .into_iter()
            .map(|storage| Partition {
                storage,
                log: Mutex::new(PartitionLog {
                    next_offset: 0,
                    subscribers: Vec::new(),
                }),
            })
            .collect();
        Ok(Self { name, partitions })
    }

    /// Инициализировать storage'и и восстановить offset'ы партиций.
    pub async fn init(&self) -> Result<(), TopicError> {
        for (i, part) in self.partitions.iter().enumerate() {
            let next = part.storage.init().await.map_err(TopicError::Storage)?;
            part.log.lock().await.next_offset = next;
            if next > 0 {
                tracing::info!(topic = %self.name, partition = i, next_offset = next, "recovered partition");
            }
        }
        Ok(())
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Стабильная партиция для ключа (FNV-1a).
    pub fn partition_for(&self, key: &str) -> u32 {
        fnv1a(key.as_bytes()) % self.partition_count()
    }

    fn partition(&self, partition: u32) -> Result<&Partition, TopicError> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| TopicError::NoPartition {
                topic: self.name.clone(),
                partition,
            })
    }

    /// Опубликовать запись: append → notify all subscribers.
    pub async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<Ack, TopicError> {
        let partition = self.partition_for(key);
        let part = self.partition(partition)?;

        let mut log = part.log.lock().await;
        let record = RawRecord {
            partition,
            offset: log.next_offset,
            ts_ms: now_ms(),
            key: key.to_string(),
            payload,
        };

        // 1. Persist to storage
        part.storage
            .append(std::slice::from_ref(&record))
            .await
            .map_err(TopicError::Storage)?;
        log.next_offset += 1;

        // 2. Send to all subscribers
        let ack = Ack { partition, offset: record.offset };
        notify(&self.name, &mut log.subscribers, record).await;
        Ok(ack)
    }

    /// Подписаться на партицию начиная с `from_offset`.
    pub async fn subscribe(
        &self,
        partition: u32,
        from_offset: u64,
        buffer: usize,
        overflow: OverflowPolicy,
    ) -> Result<MpscSubscription, TopicError> {
        let part = self.partition(partition)?;
        let mut log = part.log.lock().await;

        let backlog = if from_offset < log.next_offset {
            part.storage
                .read(from_offset, None)
                .await
                .map_err(TopicError::Storage)?
        } else {
            Vec::new()
        };

        // Брошенные подписки иначе чистит только notify().
        log.subscribers.retain(|s| !s.tx.is_closed());
        let (tx, rx) = mpsc::channel(buffer.max(1));
        log.subscribers.push(Subscriber { tx, overflow });
        tracing::debug!(
            topic = %self.name,
            partition,
            from_offset,
            backlog = backlog.len(),
            "subscribed"
        );
        Ok(MpscSubscription {
            backlog: backlog.into(),
            rx,
            from_offset,
        })
    }

    /// Следующий offset, который получит партиция.
    pub async fn end_offset(&self, partition: u32) -> Result<u64, TopicError> {
        Ok(self.partition(partition)?.log.lock().await.next_offset)
    }

    /// Прочитать данные из storage.
    pub async fn read(&self, query: &LogQuery) -> Result<Vec<RawRecord>, TopicError> {
        let range = match query.partition {
            Some(p) => {
                self.partition(p)?;
                p..p + 1
            }
            None => 0..self.partition_count(),
        };
        let mut result = Vec::new();
        for p in range {
            let part = self.partition(p)?;
            let records = part
                .storage
                .read(query.from_offset.unwrap_or(0), query.limit)
                .await
                .map_err(TopicError::Storage)?;
            result.extend(records);
        }
        Ok(result)
    }

    /// Flush storage всех партиций.
    pub async fn flush(&self) -> Result<(), TopicError> {
        for part in &self.partitions {
            part.storage.flush().await.map_err(TopicError::Storage)?;
        }
        Ok(())
    }
}

/// Разослать запись подписчикам партиции с учётом overflow policy.
async fn notify(topic: &str, subs: &mut Vec<Subscriber>, record: RawRecord) {
    let mut i = 0;
    while i < subs.len() {
        let sub = &subs[i];
        if sub.tx.is_closed() {
            subs.swap_remove(i);
            continue;
        }
        match sub.overflow {
            OverflowPolicy::Drop => match sub.tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(topic = %topic, partition = record.partition, offset = record.offset, "subscriber channel full, dropping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    subs.swap_remove(i);
                    continue;
                }
            },
            OverflowPolicy::BackPressure => {
                if sub.tx.send(record.clone()).await.is_err() {
                    tracing::debug!(topic = %topic, "subscriber closed during backpressure send");
                    subs.swap_remove(i);
                    continue;
                }
            }
        }
        i += 1;
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ═══════════════════════════════════════════════════════════════
//  TopicRegistry
// ═══════════════════════════════════════════════════════════════

/// Реестр всех topic'ов. Реализует LogPublisher, LogSubscriber
/// и LogInspector.
pub struct TopicRegistry {
    topics: HashMap<String, Arc<Topic>>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
        }
    }

    pub fn register(&mut self, topic: Topic) {
        let name = topic.name.clone();
        self.topics.insert(name, Arc::new(topic));
    }

    pub fn get(&self, topic: &str) -> Result<Arc<Topic>, TopicError> {
        self.topics
            .get(topic)
            .cloned()
            .ok_or_else(|| TopicError::NotFound(topic.to_string()))
    }
}

impl LogPublisher for TopicRegistry {
    fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> LogFuture<'_, Ack> {
        let topic_arc = self.get(topic);
        let key = key.to_string();
        Box::pin(async move {
            let t = topic_arc.map_err(TopicError::into_log_error)?;
            t.publish(&key, payload).await.map_err(TopicError::into_log_error)
        })
    }
}

impl LogSubscriber for TopicRegistry {
    fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        buffer: usize,
        overflow: OverflowPolicy,
    ) -> LogFuture<'_, Box<dyn LogSubscription>> {
        let topic_arc = self.get(topic);
        Box::pin(async move {
            let t = topic_arc.map_err(TopicError::into_log_error)?;
            let sub = t
                .subscribe(partition, from_offset, buffer, overflow)
                .await
                .map_err(TopicError::into_log_error)?;
            Ok(Box::new(sub) as Box<dyn LogSubscription>)
        })
    }

    fn end_offset(&self, topic: &str, partition: u32) -> LogFuture<'_, u64> {
        let topic_arc = self.get(topic);
        Box::pin(async move {
            let t = topic_arc.map_err(TopicError::into_log_error)?;
            t.end_offset(partition).await.map_err(TopicError::into_log_error)
        })
    }
}

impl LogInspector for TopicRegistry {
    fn query(&self, topic: &str, query: &LogQuery) -> LogFuture<'_, Vec<RawRecord>> {
        let topic_arc = self.get(topic);
        let query = query.clone();
        Box::pin(async move {
            let t = topic_arc.map_err(TopicError::into_log_error)?;
            t.read(&query).await.map_err(TopicError::into_log_error)
        })
    }

    fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    fn partitions(&self, topic: &str) -> Option<u32> {
        self.topics.get(topic).map(|t| t.partition_count())
    }

    fn flush_topic(&self, topic: &str) -> LogFuture<'_, ()> {
        let topic_arc = self.get(topic);
        Box::pin(async move {
            let t = topic_arc.map_err(TopicError::into_log_error)?;
            t.flush().await.map_err(TopicError::into_log_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use storage_memory::MemoryStorage;
    use streamfold_api::ErrorKind;

    use super::*;

    fn memory_topic(name: &str, partitions: u32) -> Topic {
        let storages = (0..partitions)
            .map(|_| Arc::new(MemoryStorage::new(1000)) as Arc<dyn LogStorage>)
            .collect();
        Topic::new(name.to_string(), storages).unwrap()
    }

    async fn recv(sub: &mut MpscSubscription) -> RawRecord {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for record")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn offsets_are_dense_per_partition() {
        let topic = memory_topic("clicks", 4);
        topic.init().await.unwrap();

        let p = topic.partition_for("user1");
        for expected in 0..3 {
            let ack = topic.publish("user1", b"user1".to_vec()).await.unwrap();
            assert_eq!(ack, Ack { partition: p, offset: expected });
        }
        assert_eq!(topic.end_offset(p).await.unwrap(), 3);
        assert_eq!(topic.partition_for("user1"), p);
    }

    #[tokio::test]
    async fn subscription_replays_backlog_then_streams_live() {
        let topic = memory_topic("weather-data", 1);
        topic.init().await.unwrap();
        for i in 0..3 {
            topic.publish("", format!("r{i}").into_bytes()).await.unwrap();
        }

        let mut sub = topic
            .subscribe(0, 1, 16, OverflowPolicy::BackPressure)
            .await
            .unwrap();
        topic.publish("", b"r3".to_vec()).await.unwrap();

        let offsets = [
            recv(&mut sub).await.offset,
            recv(&mut sub).await.offset,
            recv(&mut sub).await.offset,
        ];
        assert_eq!(offsets, [1, 2, 3]);
    }

    #[tokio::test]
    async fn drop_policy_leaves_visible_offset_gap() {
        let topic = memory_topic("t", 1);
        topic.init().await.unwrap();
        let mut sub = topic.subscribe(0, 0, 1, OverflowPolicy::Drop).await.unwrap();

        for _ in 0..3 {
            topic.publish("", b"x".to_vec()).await.unwrap();
        }
        assert_eq!(recv(&mut sub).await.offset, 0);
        topic.publish("", b"x".to_vec()).await.unwrap();
        // offsets 1 и 2 потеряны для этого подписчика, но остались в storage
        assert_eq!(recv(&mut sub).await.offset, 3);
        let stored = topic
            .read(&LogQuery { partition: Some(0), from_offset: Some(1), limit: Some(2) })
            .await
            .unwrap();
        assert_eq!(stored.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn init_resumes_after_stored_records() {
        let storage = Arc::new(MemoryStorage::new(10));
        let existing = RawRecord {
            partition: 0,
            offset: 41,
            ts_ms: 0,
            key: String::new(),
            payload: Vec::new(),
        };
        storage.append(&[existing]).await.unwrap();

        let topic = Topic::new("t".into(), vec![storage as Arc<dyn LogStorage>]).unwrap();
        topic.init().await.unwrap();
        let ack = topic.publish("", b"next".to_vec()).await.unwrap();
        assert_eq!(ack.offset, 42);
    }

    #[tokio::test]
    async fn registry_reports_unknown_topics() {
        let mut registry = TopicRegistry::new();
        registry.register(memory_topic("clicks", 2));

        assert_eq!(registry.topics(), vec!["clicks".to_string()]);
        assert_eq!(registry.partitions("clicks"), Some(2));
        assert_eq!(registry.partitions("nope"), None);

        let err = LogPublisher::publish(&registry, "nope", "k", Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Logic);
        assert_eq!(err.message(), "topic 'nope' not found");

        let err = LogSubscriber::subscribe(&registry, "clicks", 9, 0, 8, OverflowPolicy::Drop)
            .await
            .err()
            .unwrap();
        assert_eq!(err.message(), "topic 'clicks' has no partition 9");
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned_on_subscribe() {
        let topic = memory_topic("t", 1);
        topic.init().await.unwrap();
        for _ in 0..100 {
            let sub = topic.subscribe(0, 0, 4, OverflowPolicy::Drop).await.unwrap();
            drop(sub);
        }
        let _live = topic.subscribe(0, 0, 4, OverflowPolicy::Drop).await.unwrap();
        assert_eq!(topic.partitions[0].log.lock().await.subscribers.len(), 1);
    }

    #[tokio::test]
    async fn registry_reports_end_offset() {
        let mut registry = TopicRegistry::new();
        registry.register(memory_topic("clicks", 1));
        assert_eq!(LogSubscriber::end_offset(&registry, "clicks", 0).await.unwrap(), 0);
        LogPublisher::publish(&registry, "clicks", "u", b"u".to_vec()).await.unwrap();
        assert_eq!(LogSubscriber::end_offset(&registry, "clicks", 0).await.unwrap(), 1);
        assert!(LogSubscriber::end_offset(&registry, "clicks", 3).await.is_err());
    }

    #[test]
    fn topic_without_partitions_is_rejected() {
        let err = Topic::new("empty".into(), Vec::new()).err().unwrap();
        assert_eq!(err.into_log_error().kind(), ErrorKind::Config);
    }
}
