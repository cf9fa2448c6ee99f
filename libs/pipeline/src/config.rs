use std::time::Duration;

use serde::Deserialize;

use state_store::FoldMode;
use streamfold_api::{OverflowPolicy, RecordKind};

// ═══════════════════════════════════════════════════════════════
//  Topic Config
// ═══════════════════════════════════════════════════════════════

/// Конфигурация topic'а: партиции + storage backend.
#[derive(Debug, Deserialize)]
pub struct TopicConfig {
    /// Имя topic'а (e.g., "weather-data", "click-counts").
    pub name: String,
    /// Количество партиций.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Storage backend: "memory" или "file".
    #[serde(default = "default_topic_storage")]
    pub storage: String,
    /// Конфигурация storage (max_records, data_dir, fsync).
    #[serde(default)]
    pub storage_config: Option<toml::Value>,
}

fn default_partitions() -> u32 {
    4
}
fn default_topic_storage() -> String {
    "memory".into()
}

// ═══════════════════════════════════════════════════════════════
//  Pipeline Config
// ═══════════════════════════════════════════════════════════════

/// Конфигурация агрегирующего pipeline'а: input topic → fold → output topic.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Вид записей: "weather" или "click".
    pub kind: RecordKind,
    /// Входной topic.
    pub input_topic: String,
    /// Topic для обновлённых агрегатов. None — не публиковать.
    #[serde(default)]
    pub output_topic: Option<String>,
    /// Размер пула worker'ов. Больше числа партиций не имеет смысла.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Количество shard'ов state store'а.
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Обработка повторной доставки: "idempotent" или "at_least_once".
    #[serde(default)]
    pub fold_mode: FoldMode,
    /// Порог фильтра температуры, °C (weather).
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Размер буфера подписки на партицию.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// Стратегия переполнения подписки.
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
    /// Период фиксации checkpoint'а.
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl PipelineConfig {
    /// Конфиг со значениями по умолчанию.
    pub fn new(kind: RecordKind, input_topic: impl Into<String>) -> Self {
        Self {
            kind,
            input_topic: input_topic.into(),
            output_topic: None,
            workers: default_workers(),
            shards: default_shards(),
            fold_mode: FoldMode::default(),
            threshold: default_threshold(),
            buffer: default_buffer(),
            overflow: default_overflow(),
            commit_interval_ms: default_commit_interval_ms(),
            retry: RetryPolicy::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("pipeline: workers must be > 0".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("pipeline.retry: max_attempts must be > 0".into());
        }
        if !self.threshold.is_finite() {
            return Err("pipeline: threshold must be finite".into());
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    2
}
fn default_shards() -> usize {
    64
}
fn default_threshold() -> f64 {
    30.0
}
fn default_buffer() -> usize {
    1024
}
fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::BackPressure
}
fn default_commit_interval_ms() -> u64 {
    1000
}

/// Повторы с экспоненциальным backoff'ом.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Пауза перед попыткой `attempt + 1` (attempt считается с 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5000
}

/// Где хранить checkpoint'ы.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointConfig {
    /// Директория для `checkpoint.json`. None — в памяти процесса.
    #[serde(default)]
    pub dir: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
//  Source Config
// ═══════════════════════════════════════════════════════════════

/// TCP source: каждая строка публикуется в topic.
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_name")]
    pub name: String,
    /// Адрес для listen, e.g. "0.0.0.0:9300".
    pub listen: String,
    /// Topic, в который source публикует записи.
    pub topic: String,
    /// Максимальная длина строки в байтах.
    #[serde(default = "default_max_line")]
    pub max_line: usize,
}

fn default_source_name() -> String {
    "unnamed".into()
}
fn default_max_line() -> usize {
    64 * 1024
}

// ═══════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════

/// Сериализовать Option<toml::Value> в JSON-строку (или "{}").
pub fn config_json_or_empty(val: &Option<toml::Value>) -> Result<String, crate::PipelineError> {
    match val {
        Some(v) => Ok(serde_json::to_string(v)?),
        None => Ok("{}".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_from_toml() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            kind = "weather"
            input_topic = "weather-data"
            output_topic = "station-averages"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.kind, RecordKind::Weather);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.fold_mode, FoldMode::Idempotent);
        assert_eq!(cfg.threshold, 30.0);
        assert_eq!(cfg.overflow, OverflowPolicy::BackPressure);
        assert!(cfg.checkpoint.dir.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let retry = RetryPolicy { max_attempts: 10, initial_backoff_ms: 100, max_backoff_ms: 1000 };
        let delays: Vec<u64> = (1..=6).map(|a| retry.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn storage_config_becomes_json() {
        let cfg: TopicConfig = toml::from_str(
            r#"
            name = "clicks"
            storage = "file"
            storage_config = { data_dir = "/var/lib/streamfold" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.partitions, 4);
        let json = config_json_or_empty(&cfg.storage_config).unwrap();
        assert_eq!(json, r#"{"data_dir":"/var/lib/streamfold"}"#);
        assert_eq!(config_json_or_empty(&None).unwrap(), "{}");
    }
}
