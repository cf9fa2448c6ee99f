use std::sync::Arc;

use state_store::{FoldMode, SourcePosition, StateStore};
use streamfold_api::{AggregateState, Codec, DecodeError, DomainRecord, RawRecord, RecordKind};

use crate::codec::codec_for;
use crate::config::PipelineConfig;
use crate::error::PipelineError;

pub type FilterFn = Box<dyn Fn(&DomainRecord) -> bool + Send + Sync>;
pub type MapFn = Box<dyn Fn(DomainRecord) -> DomainRecord + Send + Sync>;
pub type KeyFn = Box<dyn Fn(&DomainRecord) -> String + Send + Sync>;
pub type InitFn = Arc<dyn Fn() -> AggregateState + Send + Sync>;
pub type FoldFn = Box<dyn Fn(&str, &DomainRecord, AggregateState) -> AggregateState + Send + Sync>;
pub type ProjectFn = Box<dyn Fn(&AggregateState) -> String + Send + Sync>;

/// Stateless стадия до группировки. Порядок объявления сохраняется.
enum Step {
    Filter(FilterFn),
    Map(MapFn),
}

// ═══════════════════════════════════════════════════════════════
//  Stages (builder)
// ═══════════════════════════════════════════════════════════════

/// Описание pipeline'а: codec → filter/map… → key → fold → projection.
pub struct Stages {
    codec: Arc<dyn Codec>,
    steps: Vec<Step>,
    key_by: Option<KeyFn>,
    init: Option<InitFn>,
    fold: Option<FoldFn>,
    project: Option<ProjectFn>,
}

impl Stages {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            steps: Vec::new(),
            key_by: None,
            init: None,
            fold: None,
            project: None,
        }
    }

    /// Пропустить дальше только записи, для которых `pred` истинен.
    pub fn filter(mut self, pred: impl Fn(&DomainRecord) -> bool + Send + Sync + 'static) -> Self {
        self.steps.push(Step::Filter(Box::new(pred)));
        self
    }

    pub fn map(mut self, f: impl Fn(DomainRecord) -> DomainRecord + Send + Sync + 'static) -> Self {
        self.steps.push(Step::Map(Box::new(f)));
        self
    }

    pub fn key_by(mut self, f: impl Fn(&DomainRecord) -> String + Send + Sync + 'static) -> Self {
        self.key_by = Some(Box::new(f));
        self
    }

    /// `init` — нулевое состояние нового ключа, `fold` — шаг свёртки.
    pub fn aggregate(
        mut self,
        init: impl Fn() -> AggregateState + Send + Sync + 'static,
        fold: impl Fn(&str, &DomainRecord, AggregateState) -> AggregateState + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Arc::new(init));
        self.fold = Some(Box::new(fold));
        self
    }

    pub fn project(mut self, f: impl Fn(&AggregateState) -> String + Send + Sync + 'static) -> Self {
        self.project = Some(Box::new(f));
        self
    }

    /// Средние температура (°F) и влажность по станции для показаний
    /// выше `threshold` °C.
    pub fn weather(threshold: f64) -> Self {
        Self::new(codec_for(RecordKind::Weather))
            .filter(move |rec| match rec {
                DomainRecord::Weather(r) => r.temperature > threshold,
                _ => false,
            })
            .map(|rec| match rec {
                DomainRecord::Weather(mut r) => {
                    r.temperature = celsius_to_fahrenheit(r.temperature);
                    DomainRecord::Weather(r)
                }
                other => other,
            })
            .key_by(|rec| rec.natural_key().to_string())
            .aggregate(|| RecordKind::Weather.initial_state(), fold_weather)
            .project(project_weather)
    }

    /// Количество кликов по пользователю.
    pub fn clicks() -> Self {
        Self::new(codec_for(RecordKind::Click))
            .key_by(|rec| rec.natural_key().to_string())
            .aggregate(|| RecordKind::Click.initial_state(), |_, rec, state| match (rec, state) {
                (DomainRecord::Click(_), AggregateState::Click(mut c)) => {
                    c.count += 1;
                    AggregateState::Click(c)
                }
                (_, other) => other,
            })
            .project(|state| state.count().to_string())
    }
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

fn fold_weather(_key: &str, rec: &DomainRecord, state: AggregateState) -> AggregateState {
    match (rec, state) {
        (DomainRecord::Weather(r), AggregateState::Weather(mut s)) => {
            s.count += 1;
            s.temp_sum += r.temperature;
            s.humidity_sum += r.humidity;
            AggregateState::Weather(s)
        }
        (_, other) => other,
    }
}

fn project_weather(state: &AggregateState) -> String {
    let averages = match state {
        AggregateState::Weather(s) => s.averages(),
        _ => None,
    };
    match averages {
        Some((temp, humidity)) => format!(
            "Température Moyenne = {temp:.2}°F, Humidité Moyenne = {humidity:.2}%"
        ),
        None => "No data".to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Pipeline
// ═══════════════════════════════════════════════════════════════

/// Результат обработки одной входной записи.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Payload не декодируется. Запись отброшена.
    Malformed(DecodeError),
    /// Отсеяна filter-стадией. Состояние не тронуто.
    Filtered,
    /// Запись уже была свёрнута раньше (replay). Состояние не изменилось.
    Duplicate {
        key: String,
        version: u64,
        output: String,
    },
    /// Состояние ключа обновлено.
    Updated {
        key: String,
        version: u64,
        output: String,
    },
}

/// Собранный pipeline. Все стадии чистые; состояние живёт в StateStore.
pub struct Pipeline {
    codec: Arc<dyn Codec>,
    steps: Vec<Step>,
    key_by: KeyFn,
    init: InitFn,
    fold: FoldFn,
    project: ProjectFn,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("kind", &self.codec.kind())
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl Pipeline {
    pub fn build(stages: Stages) -> Result<Self, PipelineError> {
        Ok(Self {
            codec: stages.codec,
            steps: stages.steps,
            key_by: stages.key_by.ok_or(PipelineError::MissingStage("key_by"))?,
            init: stages.init.ok_or(PipelineError::MissingStage("aggregate"))?,
            fold: stages.fold.ok_or(PipelineError::MissingStage("aggregate"))?,
            project: stages.project.ok_or(PipelineError::MissingStage("project"))?,
        })
    }

    /// Preset по конфигу pipeline'а.
    pub fn for_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        match config.kind {
            RecordKind::Weather => Self::build(Stages::weather(config.threshold)),
            RecordKind::Click => Self::build(Stages::clicks()),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.codec.kind()
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DomainRecord, DecodeError> {
        self.codec.decode(bytes)
    }

    /// Пустой store с инициализатором этого pipeline'а.
    pub fn new_store(&self, shards: usize, mode: FoldMode) -> StateStore<AggregateState> {
        let init = Arc::clone(&self.init);
        StateStore::new(shards, mode, move || init())
    }

    /// Stateless часть: filter/map по порядку, затем ключ.
    /// None — запись отсеяна.
    pub fn prepare(&self, record: DomainRecord) -> Option<(String, DomainRecord)> {
        let mut record = record;
        for step in &self.steps {
            match step {
                Step::Filter(pred) => {
                    if !pred(&record) {
                        return None;
                    }
                }
                Step::Map(f) => record = f(record),
            }
        }
        let key = (self.key_by)(&record);
        Some((key, record))
    }

    pub fn project(&self, state: &AggregateState) -> String {
        (self.project)(state)
    }

    /// Полный проход одной записи: decode → stages → fold в store.
    pub fn process(&self, store: &StateStore<AggregateState>, raw: &RawRecord) -> Outcome {
        let record = match self.decode(&raw.payload) {
            Ok(record) => record,
            Err(e) => return Outcome::Malformed(e),
        };
        let Some((key, record)) = self.prepare(record) else {
            return Outcome::Filtered;
        };

        let position = SourcePosition {
            partition: raw.partition,
            offset: raw.offset,
        };
        let applied = store.apply(&key, Some(position), &record, |k, r, s| (self.fold)(k, r, s));
        let output = self.project(&applied.state);

        if applied.duplicate {
            Outcome::Duplicate {
                key,
                version: applied.version,
                output,
            }
        } else {
            Outcome::Updated {
                key,
                version: applied.version,
                output,
            }
        }
    }
}
