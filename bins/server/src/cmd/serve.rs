use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ServeArgs, ServerConfig, TopicConfig};
use crate::error::ServerError;
use http_api::AppState;
use pipeline::config::config_json_or_empty;
use pipeline::{Engine, LineSource, PipelineError, codec_for};
use state_store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use storage_file::FileStorageFactory;
use storage_memory::MemoryStorageFactory;
use streamfold_api::{LogInspector, LogPublisher, LogStorage, StorageFactory};
use topic_engine::{Topic, TopicRegistry};

fn storage_factory(name: &str) -> Result<Box<dyn StorageFactory>, ServerError> {
    match name {
        "memory" => Ok(Box::new(MemoryStorageFactory)),
        "file" => Ok(Box::new(FileStorageFactory)),
        other => Err(ServerError::StorageNotFound(other.to_string())),
    }
}

/// Создать и инициализировать topic'и. Для file storage — восстановить
/// offset'ы с диска.
pub(crate) async fn build_registry(topics: &[TopicConfig]) -> Result<TopicRegistry, ServerError> {
    let mut registry = TopicRegistry::new();

    for topic_cfg in topics {
        let factory = storage_factory(&topic_cfg.storage)?;
        let config_json = config_json_or_empty(&topic_cfg.storage_config)?;

        let mut storages: Vec<Arc<dyn LogStorage>> = Vec::with_capacity(topic_cfg.partitions as usize);
        for partition in 0..topic_cfg.partitions {
            let storage = factory
                .create(&topic_cfg.name, partition, &config_json)
                .map_err(|source| ServerError::Storage {
                    topic: topic_cfg.name.clone(),
                    partition,
                    source,
                })?;
            storages.push(storage);
        }

        let topic = Topic::new(topic_cfg.name.clone(), storages)?;
        topic.init().await?;
        tracing::info!(
            topic = %topic_cfg.name,
            partitions = topic_cfg.partitions,
            storage = %topic_cfg.storage,
            "registered topic"
        );
        registry.register(topic);
    }

    Ok(registry)
}

fn checkpoint_store(config: &ServerConfig) -> Arc<dyn CheckpointStore> {
    match &config.pipeline.checkpoint.dir {
        Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
        None => Arc::new(MemoryCheckpointStore::new()),
    }
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("streamfold-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(config = %args.config, kind = %config.pipeline.kind, "loaded config");

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Topics ---
    let registry = Arc::new(build_registry(&config.topics).await?);
    let partitions = registry
        .partitions(&config.pipeline.input_topic)
        .ok_or_else(|| ServerError::TopicNotDeclared(config.pipeline.input_topic.clone()))?;

    // --- Engine ---
    let checkpoints = checkpoint_store(&config);
    tracing::info!(checkpoint = %checkpoints.describe(), "checkpoint store");
    let output = config
        .pipeline
        .output_topic
        .as_ref()
        .map(|_| registry.clone() as Arc<dyn LogPublisher>);
    let engine = Arc::new(Engine::new(config.pipeline.clone(), checkpoints, output)?);

    let mut engine_handle = tokio::spawn(engine.clone().run(registry.clone(), partitions, token.clone()));

    // --- Sources ---
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for source_cfg in &config.sources {
        let codec = (source_cfg.topic == config.pipeline.input_topic)
            .then(|| codec_for(config.pipeline.kind));
        let source = LineSource::bind(source_cfg, codec, registry.clone()).await?;
        tracing::info!(
            source = %source_cfg.name,
            listen = %source_cfg.listen,
            topic = %source_cfg.topic,
            "spawned line source"
        );
        handles.push(source.spawn(token.clone()));
    }

    // --- HTTP API ---
    let api_state = AppState {
        log: registry.clone(),
        publisher: registry.clone(),
        engine: engine.clone(),
        default_user: config.clicks.user.clone(),
    };
    let api_token = token.clone();
    let api_port = config.api_port;
    let mut api_handle = tokio::spawn(async move { http_api::run(api_port, api_state, api_token).await });

    tracing::info!("server ready");

    // --- Ожидание Ctrl+C или падения engine'а ---
    let mut fatal: Option<ServerError> = None;
    let mut engine_done = false;
    let mut api_done = false;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down...");
        }
        joined = &mut engine_handle => {
            engine_done = true;
            match joined {
                Ok(Ok(())) => tracing::warn!("engine stopped without a signal"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "engine failed");
                    fatal = Some(e.into());
                }
                Err(e) => {
                    tracing::error!(error = %e, "engine task panicked");
                    fatal = Some(PipelineError::Task(e.to_string()).into());
                }
            }
        }
        joined = &mut api_handle => {
            api_done = true;
            if let Ok(Err(e)) = joined {
                tracing::error!(error = %e, "api server failed");
                fatal = Some(e.into());
            }
        }
    }

    // Signal all tasks to stop cooperatively
    token.cancel();

    // Drain: engine доводит in-flight записи и пишет финальный checkpoint
    let drain = Duration::from_millis(config.drain_timeout_ms);
    if !engine_done {
        match tokio::time::timeout(drain, &mut engine_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                tracing::error!(error = %e, "engine failed during shutdown");
                if fatal.is_none() {
                    fatal = Some(e.into());
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "engine task panicked");
                if fatal.is_none() {
                    fatal = Some(PipelineError::Task(e.to_string()).into());
                }
            }
            Err(_) => {
                tracing::warn!(timeout_ms = config.drain_timeout_ms, "engine did not drain in time, aborting");
                engine_handle.abort();
            }
        }
    }

    for h in &handles {
        if !h.is_finished() {
            h.abort();
        }
    }
    for h in handles {
        let _ = h.await;
    }
    if !api_done && tokio::time::timeout(drain, &mut api_handle).await.is_err() {
        api_handle.abort();
    }

    // Flush all topic storages
    for topic_name in registry.topics() {
        if let Err(e) = registry.flush_topic(&topic_name).await {
            tracing::error!(topic = %topic_name, error = ?e, "flush error");
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => {
            tracing::info!("shutdown complete");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::config::TopicConfig;
    use streamfold_api::LogQuery;

    fn topic(name: &str, storage: &str, storage_config: Option<toml::Value>) -> TopicConfig {
        TopicConfig {
            name: name.into(),
            partitions: 2,
            storage: storage.into(),
            storage_config,
        }
    }

    #[tokio::test]
    async fn registry_uses_configured_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut file_cfg = toml::map::Map::new();
        file_cfg.insert(
            "data_dir".into(),
            toml::Value::String(dir.path().display().to_string()),
        );
        let topics = vec![
            topic("clicks", "memory", None),
            topic("weather-data", "file", Some(toml::Value::Table(file_cfg))),
        ];

        let registry = build_registry(&topics).await.unwrap();
        assert_eq!(registry.topics(), vec!["clicks", "weather-data"]);
        assert_eq!(registry.partitions("weather-data"), Some(2));

        registry
            .publish("weather-data", "StationA", b"StationA,35.0,60.0".to_vec())
            .await
            .unwrap();
        registry.flush_topic("weather-data").await.unwrap();
        drop(registry);

        // file storage переживает пересоздание registry
        let reopened = build_registry(&topics).await.unwrap();
        let records = reopened.query("weather-data", &LogQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "StationA");
    }

    #[tokio::test]
    async fn unknown_storage_is_rejected() {
        let err = build_registry(&[topic("t", "clickhouse", None)]).await.err().unwrap();
        assert!(matches!(err, ServerError::StorageNotFound(ref s) if s == "clickhouse"));
    }
}
