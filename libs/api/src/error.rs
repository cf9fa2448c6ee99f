/// Category of a log error. Allows the host to make intelligent
/// decisions about error handling (skip, retry, fail fast).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration — permanent, fail at startup.
    Config,
    /// I/O or network error — transient, may retry.
    Io,
    /// Data format/parse error — bad input, skip record.
    Format,
    /// Logical error (not found, invalid state, generic).
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Format => f.write_str("format"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Unified error type for all log trait methods (storage, publish, subscribe).
///
/// Carries an `ErrorKind` for categorization and a human-readable message.
/// `From` impls assign the appropriate kind automatically and allow
/// ergonomic `?` in storage implementations.
#[derive(Clone, PartialEq, Eq)]
pub struct LogError {
    kind: ErrorKind,
    message: String,
}

impl LogError {
    /// Generic logic error (default kind).
    pub fn new(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    /// Configuration error — permanent, fail at startup.
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    /// I/O error — transient, may retry.
    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    /// Format/parse error — bad input, skip record.
    pub fn format_err(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Имеет ли смысл повторять операцию.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Io
    }
}

impl std::fmt::Debug for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LogError {}

impl From<String> for LogError {
    fn from(s: String) -> Self {
        Self {
            kind: ErrorKind::Logic,
            message: s,
        }
    }
}

impl From<&str> for LogError {
    fn from(s: &str) -> Self {
        Self {
            kind: ErrorKind::Logic,
            message: s.to_string(),
        }
    }
}

impl From<std::io::Error> for LogError {
    fn from(e: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Format,
            message: e.to_string(),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Decode errors
// ════════════════════════════════════════════════════════════════

/// Ошибка декодирования payload'а в доменную запись.
///
/// Всегда локально восстановима: запись отбрасывается и учитывается
/// в статистике, pipeline продолжает работу.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8")]
    Utf8,

    #[error("empty payload")]
    Empty,

    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("field '{field}': invalid number '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("record is not a {0} record")]
    VariantMismatch(crate::RecordKind),
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(_: std::str::Utf8Error) -> Self {
        DecodeError::Utf8
    }
}

impl From<DecodeError> for LogError {
    fn from(e: DecodeError) -> Self {
        LogError::format_err(e.to_string())
    }
}
