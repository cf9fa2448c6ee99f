mod config;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use streamfold_api::{LogError, LogStorage, StorageFactory};

pub use config::FileStorageConfig;
pub use storage::FileStorage;

/// Фабрика file storage: одна JSONL-партиция на файл.
pub struct FileStorageFactory;

impl StorageFactory for FileStorageFactory {
    fn create(
        &self,
        topic: &str,
        partition: u32,
        config_json: &str,
    ) -> Result<Arc<dyn LogStorage>, LogError> {
        let config: FileStorageConfig = serde_json::from_str(config_json)
            .map_err(|e| LogError::config(format!("file storage config: {e}")))?;
        let path = PathBuf::from(&config.data_dir)
            .join(topic)
            .join(format!("{partition}.jsonl"));
        Ok(Arc::new(FileStorage::new(path, config.fsync)))
    }
}
