use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;

use streamfold_api::{LogError, LogFuture, LogStorage, RawRecord, StorageFactory};

// ═══════════════════════════════════════════════════════════════
//  MemoryStorageConfig
// ═══════════════════════════════════════════════════════════════

fn default_max_records() -> usize {
    100_000
}

#[derive(Debug, serde::Deserialize)]
pub struct MemoryStorageConfig {
    /// Retention: сколько последних записей партиции держать в памяти.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStorage
// ═══════════════════════════════════════════════════════════════

/// In-memory ring-buffer storage одной партиции. Для topic'ов, не
/// требующих дисковой persistence (e.g., output topic'и, тесты).
///
/// При переполнении вытесняются самые старые записи: чтение с
/// вытесненного offset'а начинается с самого раннего доступного.
pub struct MemoryStorage {
    records: RwLock<VecDeque<RawRecord>>,
    max_records: usize,
}

impl MemoryStorage {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(max_records.min(65536))),
            max_records: max_records.max(1),
        }
    }

    /// Количество удерживаемых записей.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl LogStorage for MemoryStorage {
    fn init(&self) -> LogFuture<'_, u64> {
        Box::pin(async move {
            let buf = self.records.read().await;
            Ok(buf.back().map(|r| r.offset + 1).unwrap_or(0))
        })
    }

    fn append(&self, records: &[RawRecord]) -> LogFuture<'_, ()> {
        let records = records.to_vec();
        Box::pin(async move {
            let mut buf = self.records.write().await;
            for record in records {
                if buf.len() >= self.max_records {
                    buf.pop_front();
                }
                buf.push_back(record);
            }
            Ok(())
        })
    }

    fn read(&self, from_offset: u64, limit: Option<usize>) -> LogFuture<'_, Vec<RawRecord>> {
        Box::pin(async move {
            let buf = self.records.read().await;
            // Offset'ы плотные: позиция = offset - offset первой записи.
            let start = match buf.front() {
                Some(first) => from_offset.saturating_sub(first.offset) as usize,
                None => return Ok(Vec::new()),
            };
            let limit = limit.unwrap_or(usize::MAX);
            Ok(buf.iter().skip(start).take(limit).cloned().collect())
        })
    }

    fn flush(&self) -> LogFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStorageFactory
// ═══════════════════════════════════════════════════════════════

pub struct MemoryStorageFactory;

impl StorageFactory for MemoryStorageFactory {
    fn create(
        &self,
        _topic: &str,
        _partition: u32,
        config_json: &str,
    ) -> Result<Arc<dyn LogStorage>, LogError> {
        let config: MemoryStorageConfig = if config_json == "{}" {
            MemoryStorageConfig::default()
        } else {
            serde_json::from_str(config_json)
                .map_err(|e| LogError::config(format!("memory storage config: {e}")))?
        };
        Ok(Arc::new(MemoryStorage::new(config.max_records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u64) -> RawRecord {
        RawRecord {
            partition: 0,
            offset,
            ts_ms: 0,
            key: "k".into(),
            payload: offset.to_string().into_bytes(),
        }
    }

    #[tokio::test]
    async fn read_from_offset_with_limit() {
        let storage = MemoryStorage::new(100);
        assert_eq!(storage.init().await.unwrap(), 0);
        let batch: Vec<_> = (0..10).map(record).collect();
        storage.append(&batch).await.unwrap();

        let got = storage.read(4, Some(3)).await.unwrap();
        let offsets: Vec<u64> = got.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![4, 5, 6]);
        assert_eq!(storage.init().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn retention_evicts_oldest() {
        let storage = MemoryStorage::new(3);
        let batch: Vec<_> = (0..5).map(record).collect();
        storage.append(&batch).await.unwrap();

        assert_eq!(storage.len().await, 3);
        // offset 0 вытеснен — чтение начинается с самого раннего (2)
        let got = storage.read(0, None).await.unwrap();
        assert_eq!(got.first().map(|r| r.offset), Some(2));
        assert!(storage.read(5, None).await.unwrap().is_empty());
    }

    #[test]
    fn factory_rejects_bad_config() {
        let err = MemoryStorageFactory
            .create("t", 0, r#"{"max_records":"lots"}"#)
            .err()
            .unwrap();
        assert_eq!(err.kind(), streamfold_api::ErrorKind::Config);
    }
}
