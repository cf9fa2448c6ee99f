use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

/// Фаза worker'а: Idle → Consuming → Folding → Checkpointing → Consuming…
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// Партиции ещё не назначены или worker остановлен.
    Idle,
    /// Ждёт следующую запись.
    Consuming,
    /// Decode → stages → fold → publish.
    Folding,
    /// Фиксирует offset обработанной записи.
    Checkpointing,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerPhase::Consuming,
            2 => WorkerPhase::Folding,
            3 => WorkerPhase::Checkpointing,
            _ => WorkerPhase::Idle,
        }
    }
}

/// Счётчики pipeline'а. Обновляются worker'ами без блокировок.
#[derive(Debug)]
pub struct PipelineStats {
    received: AtomicU64,
    malformed: AtomicU64,
    filtered: AtomicU64,
    folded: AtomicU64,
    duplicates: AtomicU64,
    published: AtomicU64,
    publish_retries: AtomicU64,
    checkpoints: AtomicU64,
    truncated: AtomicU64,
    phases: Box<[AtomicU8]>,
}

/// Сериализуемый срез счётчиков для `/api/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub folded: u64,
    pub duplicates: u64,
    pub published: u64,
    pub publish_retries: u64,
    pub checkpoints: u64,
    /// Записи, вытесненные retention'ом до обработки.
    pub truncated: u64,
    pub workers: Vec<WorkerPhase>,
}

#[derive(Debug, Clone, Copy)]
pub enum Counter {
    Received,
    Malformed,
    Filtered,
    Folded,
    Duplicates,
    Published,
    PublishRetries,
    Checkpoints,
    Truncated,
}

impl PipelineStats {
    pub fn new(workers: usize) -> Self {
        Self {
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            folded: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            published: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            phases: (0..workers).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn counter(&self, c: Counter) -> &AtomicU64 {
        match c {
            Counter::Received => &self.received,
            Counter::Malformed => &self.malformed,
            Counter::Filtered => &self.filtered,
            Counter::Folded => &self.folded,
            Counter::Duplicates => &self.duplicates,
            Counter::Published => &self.published,
            Counter::PublishRetries => &self.publish_retries,
            Counter::Checkpoints => &self.checkpoints,
            Counter::Truncated => &self.truncated,
        }
    }

    pub fn incr(&self, c: Counter) {
        self.counter(c).fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, c: Counter, n: u64) {
        self.counter(c).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.counter(c).load(Ordering::Relaxed)
    }

    pub fn set_phase(&self, worker: usize, phase: WorkerPhase) {
        if let Some(slot) = self.phases.get(worker) {
            slot.store(phase as u8, Ordering::Relaxed);
        }
    }

    pub fn phase(&self, worker: usize) -> WorkerPhase {
        self.phases
            .get(worker)
            .map(|slot| WorkerPhase::from_u8(slot.load(Ordering::Relaxed)))
            .unwrap_or(WorkerPhase::Idle)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.get(Counter::Received),
            malformed: self.get(Counter::Malformed),
            filtered: self.get(Counter::Filtered),
            folded: self.get(Counter::Folded),
            duplicates: self.get(Counter::Duplicates),
            published: self.get(Counter::Published),
            publish_retries: self.get(Counter::PublishRetries),
            checkpoints: self.get(Counter::Checkpoints),
            truncated: self.get(Counter::Truncated),
            workers: (0..self.phases.len()).map(|w| self.phase(w)).collect(),
        }
    }
}
