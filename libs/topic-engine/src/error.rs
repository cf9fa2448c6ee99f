#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("topic '{0}' not found")]
    NotFound(String),

    #[error("topic '{topic}' has no partition {partition}")]
    NoPartition { topic: String, partition: u32 },

    #[error("topic '{0}' must have at least one partition")]
    NoPartitions(String),

    #[error("storage: {0}")]
    Storage(streamfold_api::LogError),
}

impl TopicError {
    /// Convert to LogError preserving ErrorKind.
    ///
    /// `Storage(LogError)` → inner LogError as-is (kind preserved).
    /// `NotFound`/`NoPartition` → Logic kind, `NoPartitions` → Config kind.
    pub fn into_log_error(self) -> streamfold_api::LogError {
        match self {
            TopicError::Storage(e) => e,
            e @ TopicError::NoPartitions(_) => streamfold_api::LogError::config(e.to_string()),
            e => streamfold_api::LogError::new(e.to_string()),
        }
    }
}
