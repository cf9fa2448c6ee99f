use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Overflow Policy
// ════════════════════════════════════════════════════════════════

/// Стратегия поведения при переполнении bounded канала подписчика.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): если канал полон — дропнуть запись, залогировать.
    /// Потребитель увидит разрыв offset'ов и переподпишется.
    Drop,
    /// .send().await: publisher ждёт пока появится место (back-pressure).
    #[serde(alias = "backpressure")]
    BackPressure,
}

// ════════════════════════════════════════════════════════════════
//  Raw Record
// ════════════════════════════════════════════════════════════════

/// Запись партиционированного лога.
///
/// Payload — непрозрачные байты: topic-engine и storage не интерпретируют
/// его, только `Codec` декодирует в доменную запись. `(partition, offset)`
/// однозначно адресует запись внутри topic'а.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Номер партиции topic'а.
    pub partition: u32,
    /// Плотный offset внутри партиции, начиная с 0.
    pub offset: u64,
    /// Timestamp публикации в миллисекундах (Unix epoch).
    pub ts_ms: i64,
    /// Partition key (station, user id, ...). Пустой — без ключа.
    pub key: String,
    /// Байты записи. На диске хранятся в base64.
    #[serde(with = "crate::util::base64_bytes")]
    pub payload: Vec<u8>,
}

impl RawRecord {
    /// Payload как UTF-8 строка (lossy, для логов и HTTP выдачи).
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Подтверждение публикации: куда легла запись.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub partition: u32,
    pub offset: u64,
}

/// Параметры чтения из topic'а.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    /// Партиция. None — все партиции topic'а.
    pub partition: Option<u32>,
    /// Начальный offset (inclusive).
    pub from_offset: Option<u64>,
    /// Максимальное количество записей на партицию.
    pub limit: Option<usize>,
}
