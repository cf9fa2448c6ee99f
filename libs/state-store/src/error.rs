/// Ошибки чтения/восстановления состояния. Транзиентные (I/O)
/// повторяются вызывающей стороной с backoff'ом.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state io ({path}): {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("state snapshot decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StateStoreError {
    /// Имеет ли смысл повторять операцию.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateStoreError::Io { .. })
    }
}

/// Ошибка сохранения checkpoint'а. Всегда фатальна.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("checkpoint persist ({path}): {source}")]
    Persist {
        path: String,
        source: std::io::Error,
    },
}
