use serde::{Deserialize, Serialize};

use crate::DecodeError;

// ════════════════════════════════════════════════════════════════
//  Record kind
// ════════════════════════════════════════════════════════════════

/// Вид доменной записи, с которым работает pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// `station,temperature,humidity`
    Weather,
    /// Идентификатор пользователя.
    Click,
}

impl RecordKind {
    /// Нулевое значение агрегата для этого вида записей.
    pub fn initial_state(self) -> AggregateState {
        match self {
            RecordKind::Weather => AggregateState::Weather(WeatherStats::default()),
            RecordKind::Click => AggregateState::Click(ClickCount::default()),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Weather => f.write_str("weather"),
            RecordKind::Click => f.write_str("click"),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Domain records
// ════════════════════════════════════════════════════════════════

/// Показание метеостанции.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub station: String,
    /// В градусах Цельсия на входе, Фаренгейта после transform-стадии.
    pub temperature: f64,
    /// Относительная влажность, %.
    pub humidity: f64,
}

/// Клик пользователя.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub user_id: String,
}

/// Декодированная запись — tagged variant, над которым полиморфны
/// стадии pipeline'а.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainRecord {
    Weather(WeatherReading),
    Click(ClickEvent),
}

impl DomainRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            DomainRecord::Weather(_) => RecordKind::Weather,
            DomainRecord::Click(_) => RecordKind::Click,
        }
    }

    /// Естественный ключ группировки: станция или пользователь.
    pub fn natural_key(&self) -> &str {
        match self {
            DomainRecord::Weather(r) => &r.station,
            DomainRecord::Click(c) => &c.user_id,
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Aggregate state
// ════════════════════════════════════════════════════════════════

/// Накопитель для средней температуры и влажности по станции.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherStats {
    pub count: u64,
    pub temp_sum: f64,
    pub humidity_sum: f64,
}

impl WeatherStats {
    /// Средние (температура, влажность). None при `count == 0`.
    pub fn averages(&self) -> Option<(f64, f64)> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some((self.temp_sum / n, self.humidity_sum / n))
    }
}

/// Счётчик кликов пользователя.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickCount {
    pub count: u64,
}

/// Per-key агрегат. Владелец — state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateState {
    Weather(WeatherStats),
    Click(ClickCount),
}

impl AggregateState {
    pub fn kind(&self) -> RecordKind {
        match self {
            AggregateState::Weather(_) => RecordKind::Weather,
            AggregateState::Click(_) => RecordKind::Click,
        }
    }

    /// Количество свёрнутых записей.
    pub fn count(&self) -> u64 {
        match self {
            AggregateState::Weather(s) => s.count,
            AggregateState::Click(c) => c.count,
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Codec
// ════════════════════════════════════════════════════════════════

/// Codec — парсер payload'а: bytes ↔ DomainRecord.
///
/// Без побочных эффектов. Реализации: WeatherCodec, ClickCodec.
pub trait Codec: Send + Sync {
    /// Какой вид записей производит codec.
    fn kind(&self) -> RecordKind;

    /// Разобрать payload. Никогда не паникует на мусорном вводе.
    fn decode(&self, bytes: &[u8]) -> Result<DomainRecord, DecodeError>;

    /// Сериализовать запись обратно в wire-формат.
    fn encode(&self, record: &DomainRecord) -> Result<Vec<u8>, DecodeError>;
}
