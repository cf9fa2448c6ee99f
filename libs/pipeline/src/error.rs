use streamfold_api::LogError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("pipeline has no {0} stage")]
    MissingStage(&'static str),

    #[error("subscription ({topic}/{partition}): {source}")]
    Subscription {
        topic: String,
        partition: u32,
        source: LogError,
    },

    #[error("publish to '{topic}' failed after {attempts} attempt(s): {source}")]
    Publish {
        topic: String,
        attempts: u32,
        source: LogError,
    },

    #[error("checkpoint offset {checkpoint} is ahead of {topic}/{partition} end offset {end}")]
    CheckpointAhead {
        topic: String,
        partition: u32,
        checkpoint: u64,
        end: u64,
    },

    #[error("state store: {0}")]
    StateStore(#[from] state_store::StateStoreError),

    #[error("checkpoint: {0}")]
    Checkpoint(#[from] state_store::CheckpointError),

    #[error("source bind ({addr}): {source}")]
    SourceBind {
        addr: String,
        source: std::io::Error,
    },

    #[error("task: {0}")]
    Task(String),
}
