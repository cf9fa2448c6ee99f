use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use state_store::{Checkpoint, CheckpointStore, OffsetTracker, StateStore};
use streamfold_api::{AggregateState, LogPublisher, LogSubscriber, now_ms};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::publisher::OutputPublisher;
use crate::stages::Pipeline;
use crate::stats::{Counter, PipelineStats};
use crate::worker::{Forwarder, Worker};

/// Round-robin: партиция `p` достаётся worker'у `p % workers`.
pub fn assign_partitions(partitions: u32, workers: usize) -> Vec<Vec<u32>> {
    let workers = workers.max(1);
    let mut out = vec![Vec::new(); workers];
    for p in 0..partitions {
        out[p as usize % workers].push(p);
    }
    out
}

// ═══════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════

/// Агрегирующий engine: пул worker'ов над партициями входного topic'а,
/// общий state store и периодический checkpoint.
///
/// Commit gate: worker держит его в shared-режиме на время обработки
/// одной записи (fold → publish → advance), committer берёт exclusive
/// на время снимка store'а и offset'ов. Так снимок и offset'ы в одном
/// checkpoint'е всегда согласованы.
///
/// Publish с backoff'ом тоже выполняется под shared gate. Tokio `RwLock`
/// не пускает новых читателей, пока ждёт писатель, так что долгий retry
/// одного worker'а при ожидающем commit'е задерживает всех. Цена за то,
/// что checkpoint не фиксирует fold без опубликованного результата.
pub struct Engine {
    config: PipelineConfig,
    pipeline: Arc<Pipeline>,
    store: Arc<StateStore<AggregateState>>,
    tracker: OffsetTracker,
    checkpoints: Arc<dyn CheckpointStore>,
    publisher: Option<OutputPublisher>,
    stats: Arc<PipelineStats>,
    gate: RwLock<()>,
    epoch: AtomicU64,
    /// Offset'ы последнего записанного checkpoint'а.
    committed: Mutex<BTreeMap<u32, u64>>,
    failed: AtomicBool,
}

impl Engine {
    /// `output` нужен, только если в конфиге задан `output_topic`.
    pub fn new(
        config: PipelineConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        output: Option<Arc<dyn LogPublisher>>,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let pipeline = Pipeline::for_config(&config)?;
        let store = pipeline.new_store(config.shards, config.fold_mode);
        let stats = Arc::new(PipelineStats::new(config.workers));

        let publisher = match (&config.output_topic, output) {
            (Some(topic), Some(log)) => Some(OutputPublisher::new(
                log,
                topic.clone(),
                config.retry.clone(),
                Arc::clone(&stats),
            )),
            (Some(topic), None) => {
                return Err(PipelineError::Config(format!(
                    "output_topic '{topic}' configured without a publisher"
                )));
            }
            (None, _) => None,
        };

        Ok(Self {
            pipeline: Arc::new(pipeline),
            store: Arc::new(store),
            tracker: OffsetTracker::new(),
            checkpoints,
            publisher,
            stats,
            gate: RwLock::new(()),
            epoch: AtomicU64::new(0),
            committed: Mutex::new(BTreeMap::new()),
            failed: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<StateStore<AggregateState>> {
        &self.store
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn publisher(&self) -> Option<&OutputPublisher> {
        self.publisher.as_ref()
    }

    pub(crate) fn gate(&self) -> &RwLock<()> {
        &self.gate
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    // ─── Recovery ─────────────────────────────────────────────

    /// Восстановить store и offset'ы из последнего checkpoint'а.
    ///
    /// I/O ошибки чтения повторяются по `retry` policy, битый
    /// checkpoint сразу фатален.
    /// Возвращает epoch восстановленного checkpoint'а (0 — не было).
    pub async fn recover(&self) -> Result<u64, PipelineError> {
        let retry = &self.config.retry;
        let mut attempt = 1;
        let checkpoint = loop {
            let loaded = self
                .checkpoints
                .load()
                .and_then(|bytes| bytes.map(|b| Checkpoint::<AggregateState>::decode(&b)).transpose());
            match loaded {
                Ok(cp) => break cp,
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        store = %self.checkpoints.describe(), attempt, error = %e,
                        "checkpoint load failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let Some(cp) = checkpoint else {
            tracing::info!(store = %self.checkpoints.describe(), "no checkpoint, starting from offset 0");
            return Ok(0);
        };

        let keys = cp.state.entries.len();
        self.store.restore(cp.state);
        self.tracker.reset(cp.offsets.clone());
        self.epoch.store(cp.epoch, Ordering::SeqCst);
        tracing::info!(
            store = %self.checkpoints.describe(), epoch = cp.epoch, keys,
            offsets = ?cp.offsets, "recovered from checkpoint"
        );
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = cp.offsets;
        Ok(cp.epoch)
    }

    /// Checkpoint не может быть впереди входного лога: иначе подписка
    /// молча пропустит новые записи ниже восстановленного offset'а
    /// (например, memory topic после рестарта начинается с 0).
    async fn check_offsets(
        &self,
        log: &dyn LogSubscriber,
        partitions: u32,
    ) -> Result<(), PipelineError> {
        let topic = &self.config.input_topic;
        for partition in 0..partitions {
            let checkpoint = self.tracker.current_offset(partition);
            if checkpoint == 0 {
                continue;
            }
            let end = log
                .end_offset(topic, partition)
                .await
                .map_err(|source| PipelineError::Subscription {
                    topic: topic.clone(),
                    partition,
                    source,
                })?;
            if checkpoint > end {
                tracing::error!(%topic, partition, checkpoint, end, "checkpoint is ahead of input log");
                return Err(PipelineError::CheckpointAhead {
                    topic: topic.clone(),
                    partition,
                    checkpoint,
                    end,
                });
            }
        }
        Ok(())
    }

    // ─── Commit ───────────────────────────────────────────────

    /// Записать checkpoint: снимок store'а + offset'ы, атомарно.
    ///
    /// Ok(None) — нечего фиксировать (offset'ы не сдвинулись) или
    /// engine уже упал.
    pub async fn commit(&self) -> Result<Option<u64>, PipelineError> {
        let (offsets, state) = {
            let _exclusive = self.gate.write().await;
            if self.failed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let offsets = self.tracker.offsets();
            if *self.committed.lock().unwrap_or_else(PoisonError::into_inner) == offsets {
                return Ok(None);
            }
            (offsets, self.store.snapshot())
        };

        let epoch = self.epoch.load(Ordering::SeqCst) + 1;
        let checkpoint = Checkpoint {
            epoch,
            ts_ms: now_ms(),
            offsets: offsets.clone(),
            state,
        };
        let bytes = checkpoint.encode()?;

        let store = Arc::clone(&self.checkpoints);
        tokio::task::spawn_blocking(move || store.save(&bytes))
            .await
            .map_err(|e| PipelineError::Task(format!("checkpoint save: {e}")))??;

        self.epoch.store(epoch, Ordering::SeqCst);
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = offsets.clone();
        self.stats.incr(Counter::Checkpoints);
        tracing::debug!(epoch, offsets = ?offsets, "checkpoint committed");
        Ok(Some(epoch))
    }

    async fn run_committer(self: Arc<Self>, token: CancellationToken) -> Result<(), PipelineError> {
        let mut tick = tokio::time::interval(self.config.commit_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    self.commit().await?;
                }
            }
        }
    }

    // ─── Run ──────────────────────────────────────────────────

    /// Восстановиться и обрабатывать входной topic до отмены `token`.
    ///
    /// Первая ошибка любой задачи отменяет остальные и возвращается.
    /// Финальный checkpoint пишется только при чистой остановке.
    pub async fn run(
        self: Arc<Self>,
        log: Arc<dyn LogSubscriber>,
        partitions: u32,
        token: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.recover().await?;
        self.check_offsets(log.as_ref(), partitions).await?;

        let assignment = assign_partitions(partitions, self.config.workers);
        let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();

        for (id, owned) in assignment.into_iter().enumerate() {
            if owned.is_empty() {
                tracing::debug!(worker = id, "no partitions assigned");
                continue;
            }
            tracing::info!(worker = id, partitions = ?owned, topic = %self.config.input_topic, "assigning partitions");

            let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
            for partition in owned {
                let forwarder = Forwarder {
                    log: Arc::clone(&log),
                    topic: self.config.input_topic.clone(),
                    partition,
                    from_offset: self.tracker.current_offset(partition),
                    buffer: self.config.buffer,
                    overflow: self.config.overflow,
                    stats: Arc::clone(&self.stats),
                };
                tasks.spawn(forwarder.run(tx.clone(), token.clone()));
            }
            let worker = Worker {
                id,
                engine: Arc::clone(&self),
            };
            tasks.spawn(worker.run(rx, token.clone()));
        }
        tasks.spawn(Arc::clone(&self).run_committer(token.clone()));

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(PipelineError::Task(e.to_string())));
            if let Err(e) = outcome {
                tracing::error!(error = %e, "pipeline task failed");
                if result.is_ok() {
                    self.mark_failed();
                    token.cancel();
                    result = Err(e);
                }
            }
        }

        if result.is_ok() {
            if let Some(epoch) = self.commit().await? {
                tracing::info!(epoch, "final checkpoint committed");
            }
        }
        result
    }
}
