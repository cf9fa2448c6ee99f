use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use streamfold_api::{Ack, LogPublisher};

use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::stats::{Counter, PipelineStats};

/// Payload записи в output topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub key: String,
    pub version: u64,
    pub value: String,
}

/// Публикует обновлённые агрегаты в output topic.
///
/// Доставка at-least-once: (key, version), уже опубликованный этим
/// экземпляром, пропускается; после рестарта повтор перезаписывает
/// значение у потребителя, а не добавляется к нему.
pub struct OutputPublisher {
    log: Arc<dyn LogPublisher>,
    topic: String,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
    /// key → максимальная опубликованная версия.
    published: Mutex<HashMap<String, u64>>,
}

impl OutputPublisher {
    pub fn new(
        log: Arc<dyn LogPublisher>,
        topic: impl Into<String>,
        retry: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            log,
            topic: topic.into(),
            retry,
            stats,
            published: Mutex::new(HashMap::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn already_published(&self, key: &str, version: u64) -> bool {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|&v| v >= version)
    }

    fn mark_published(&self, key: &str, version: u64) {
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let v = published.entry(key.to_string()).or_insert(version);
        *v = (*v).max(version);
    }

    /// Опубликовать `value` для (key, version).
    ///
    /// Ok(None) — эта или более новая версия уже опубликована.
    /// Транзиентные (Io) ошибки повторяются с backoff'ом; исчерпание
    /// попыток или нетранзиентная ошибка — `PipelineError::Publish`.
    pub async fn publish(
        &self,
        key: &str,
        version: u64,
        value: &str,
    ) -> Result<Option<Ack>, PipelineError> {
        if self.already_published(key, version) {
            tracing::trace!(topic = %self.topic, key, version, "already published");
            return Ok(None);
        }

        let payload = serde_json::to_vec(&OutputRecord {
            key: key.to_string(),
            version,
            value: value.to_string(),
        })?;

        let mut attempt = 1;
        loop {
            match self.log.publish(&self.topic, key, payload.clone()).await {
                Ok(ack) => {
                    self.mark_published(key, version);
                    self.stats.incr(Counter::Published);
                    tracing::debug!(
                        topic = %self.topic, key, version,
                        partition = ack.partition, offset = ack.offset,
                        "aggregate published"
                    );
                    return Ok(Some(ack));
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        topic = %self.topic, key, attempt,
                        delay_ms = delay.as_millis() as u64, error = ?e,
                        "publish failed, retrying"
                    );
                    self.stats.incr(Counter::PublishRetries);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(PipelineError::Publish {
                        topic: self.topic.clone(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use streamfold_api::{LogError, LogFuture};

    /// LogPublisher, отказывающий первые `failures` вызовов.
    pub(crate) struct FlakyLog {
        pub failures: u32,
        pub transient: bool,
        pub calls: AtomicU32,
        pub sent: Mutex<Vec<(String, OutputRecord)>>,
    }

    impl FlakyLog {
        pub fn new(failures: u32, transient: bool) -> Arc<Self> {
            Arc::new(Self {
                failures,
                transient,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl LogPublisher for FlakyLog {
        fn publish(&self, topic: &str, _key: &str, payload: Vec<u8>) -> LogFuture<'_, Ack> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let topic = topic.to_string();
            Box::pin(async move {
                if call < self.failures {
                    return Err(if self.transient {
                        LogError::io("connection reset")
                    } else {
                        LogError::config("topic not found")
                    });
                }
                let rec: OutputRecord = serde_json::from_slice(&payload)?;
                self.sent.lock().unwrap().push((topic, rec));
                Ok(Ack { partition: 0, offset: call as u64 })
            })
        }
    }

    fn publisher(log: Arc<FlakyLog>, max_attempts: u32) -> (OutputPublisher, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new(1));
        let retry = RetryPolicy {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        };
        (OutputPublisher::new(log, "out", retry, stats.clone()), stats)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let log = FlakyLog::new(2, true);
        let (p, stats) = publisher(log.clone(), 5);

        let ack = p.publish("StationA", 1, "v1").await.unwrap();
        assert!(ack.is_some());
        assert_eq!(log.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.get(Counter::PublishRetries), 2);
        assert_eq!(stats.get(Counter::Published), 1);

        let sent = log.sent.lock().unwrap();
        assert_eq!(sent[0].0, "out");
        assert_eq!(
            sent[0].1,
            OutputRecord { key: "StationA".into(), version: 1, value: "v1".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_an_error() {
        let log = FlakyLog::new(u32::MAX, true);
        let (p, _) = publisher(log.clone(), 3);

        let err = p.publish("k", 1, "v").await.unwrap_err();
        assert!(matches!(err, PipelineError::Publish { attempts: 3, .. }));
        assert_eq!(log.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_fails_fast() {
        let log = FlakyLog::new(1, false);
        let (p, stats) = publisher(log.clone(), 5);

        let err = p.publish("k", 1, "v").await.unwrap_err();
        assert!(matches!(err, PipelineError::Publish { attempts: 1, .. }));
        assert_eq!(stats.get(Counter::PublishRetries), 0);
    }

    #[tokio::test]
    async fn same_or_older_version_is_skipped() {
        let log = FlakyLog::new(0, true);
        let (p, stats) = publisher(log.clone(), 1);

        assert!(p.publish("k", 2, "two").await.unwrap().is_some());
        assert!(p.publish("k", 2, "two").await.unwrap().is_none());
        assert!(p.publish("k", 1, "one").await.unwrap().is_none());
        assert!(p.publish("k", 3, "three").await.unwrap().is_some());
        assert!(p.publish("other", 1, "x").await.unwrap().is_some());

        assert_eq!(stats.get(Counter::Published), 3);
        assert_eq!(log.sent.lock().unwrap().len(), 3);
    }
}
