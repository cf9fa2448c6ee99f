use streamfold_api::LogError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("storage '{0}' not found (expected 'memory' or 'file')")]
    StorageNotFound(String),

    #[error("storage ({topic}/{partition}): {source}")]
    Storage {
        topic: String,
        partition: u32,
        source: LogError,
    },

    #[error("topic '{0}' is not declared in [[topics]]")]
    TopicNotDeclared(String),

    #[error("topic: {0}")]
    Topic(#[from] topic_engine::TopicError),

    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("api: {0}")]
    Api(#[from] http_api::ServeError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
