use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use streamfold_api::{LogSubscriber, LogSubscription, OverflowPolicy, RawRecord};

use crate::engine::Engine;
use crate::error::PipelineError;
use crate::stages::Outcome;
use crate::stats::{Counter, PipelineStats, WorkerPhase};

// ═══════════════════════════════════════════════════════════════
//  Forwarder — partition subscription → worker channel
// ═══════════════════════════════════════════════════════════════

/// Под `OverflowPolicy::Drop` хвост партиции может потеряться без
/// последующей записи, которая выдала бы разрыв. Простаивающая подписка
/// пересоздаётся с ожидаемого offset'а через этот интервал.
const DROP_RESYNC_INTERVAL: Duration = Duration::from_millis(250);

/// Подписка на одну партицию входного topic'а.
///
/// Следит за непрерывностью offset'ов: при разрыве (доставка потеряна
/// под `OverflowPolicy::Drop`) переподписывается с ожидаемого offset'а,
/// повторно доставленные записи пропускает. Разрыв в первой записи
/// свежей подписки значит, что storage уже вытеснил эти offset'ы:
/// они учитываются как `truncated`, чтение идёт дальше.
pub(crate) struct Forwarder {
    pub log: Arc<dyn LogSubscriber>,
    pub topic: String,
    pub partition: u32,
    pub from_offset: u64,
    pub buffer: usize,
    pub overflow: OverflowPolicy,
    pub stats: Arc<PipelineStats>,
}

impl Forwarder {
    async fn subscribe(&self, from_offset: u64) -> Result<Box<dyn LogSubscription>, PipelineError> {
        self.log
            .subscribe(&self.topic, self.partition, from_offset, self.buffer, self.overflow)
            .await
            .map_err(|source| PipelineError::Subscription {
                topic: self.topic.clone(),
                partition: self.partition,
                source,
            })
    }

    pub async fn run(
        self,
        tx: mpsc::Sender<RawRecord>,
        token: CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut expected = self.from_offset;
        let mut sub = self.subscribe(expected).await?;
        let mut fresh = true;
        tracing::debug!(topic = %self.topic, partition = self.partition, from = expected, "subscribed");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = next_record(sub.as_mut(), self.overflow) => next,
            };
            let record = match next {
                Some(Some(record)) => record,
                Some(None) => {
                    tracing::info!(topic = %self.topic, partition = self.partition, "subscription closed");
                    break;
                }
                None => {
                    tracing::trace!(partition = self.partition, from = expected, "idle, resubscribing");
                    sub = self.subscribe(expected).await?;
                    fresh = true;
                    continue;
                }
            };
            let first = std::mem::replace(&mut fresh, false);

            if record.offset < expected {
                tracing::trace!(partition = self.partition, offset = record.offset, "redelivery skipped");
                continue;
            }
            if record.offset > expected && first {
                let lost = record.offset - expected;
                tracing::error!(
                    topic = %self.topic, partition = self.partition,
                    expected, got = record.offset, lost,
                    "offsets evicted by storage retention, skipping"
                );
                self.stats.add(Counter::Truncated, lost);
            } else if record.offset > expected {
                tracing::warn!(
                    topic = %self.topic, partition = self.partition,
                    expected, got = record.offset,
                    "offset gap, resubscribing"
                );
                sub = self.subscribe(expected).await?;
                fresh = true;
                continue;
            }

            expected = record.offset + 1;
            tokio::select! {
                _ = token.cancelled() => break,
                sent = tx.send(record) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// None — под `Drop` подписка простаивала дольше `DROP_RESYNC_INTERVAL`.
async fn next_record(
    sub: &mut dyn LogSubscription,
    overflow: OverflowPolicy,
) -> Option<Option<RawRecord>> {
    match overflow {
        OverflowPolicy::Drop => tokio::time::timeout(DROP_RESYNC_INTERVAL, sub.recv()).await.ok(),
        OverflowPolicy::BackPressure => Some(sub.recv().await),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Worker
// ═══════════════════════════════════════════════════════════════

/// Обрабатывает записи своих партиций строго по порядку offset'ов.
pub(crate) struct Worker {
    pub id: usize,
    pub engine: Arc<Engine>,
}

impl Worker {
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<RawRecord>,
        token: CancellationToken,
    ) -> Result<(), PipelineError> {
        let stats = Arc::clone(self.engine.stats());
        tracing::info!(worker = self.id, "worker started");

        let result = loop {
            stats.set_phase(self.id, WorkerPhase::Consuming);
            let record = tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break Ok(()),
                },
            };
            // Запись, взятая в работу, доводится до конца даже при отмене.
            if let Err(e) = self.handle(&record, &token).await {
                break Err(e);
            }
        };

        stats.set_phase(self.id, WorkerPhase::Idle);
        tracing::info!(worker = self.id, ok = result.is_ok(), "worker stopped");
        result
    }

    async fn handle(&self, raw: &RawRecord, token: &CancellationToken) -> Result<(), PipelineError> {
        let engine = &self.engine;
        let stats = engine.stats();
        stats.incr(Counter::Received);

        // fold + publish + advance атомарны относительно commit'а.
        // Retry publish'а идёт под gate'ом: ожидающий committer (RwLock
        // честный) на это время блокирует и остальные worker'ы.
        let _shared = engine.gate().read().await;
        stats.set_phase(self.id, WorkerPhase::Folding);

        match engine.pipeline().process(engine.store(), raw) {
            Outcome::Malformed(e) => {
                stats.incr(Counter::Malformed);
                tracing::warn!(
                    partition = raw.partition, offset = raw.offset,
                    payload = %raw.payload_lossy(), error = %e,
                    "malformed record dropped"
                );
            }
            Outcome::Filtered => {
                stats.incr(Counter::Filtered);
                tracing::trace!(partition = raw.partition, offset = raw.offset, "filtered");
            }
            Outcome::Duplicate { key, version, output } => {
                stats.incr(Counter::Duplicates);
                tracing::debug!(partition = raw.partition, offset = raw.offset, %key, version, "already folded");
                self.publish(&key, version, &output, token).await?;
            }
            Outcome::Updated { key, version, output } => {
                stats.incr(Counter::Folded);
                tracing::debug!(partition = raw.partition, offset = raw.offset, %key, version, "folded");
                self.publish(&key, version, &output, token).await?;
            }
        }

        stats.set_phase(self.id, WorkerPhase::Checkpointing);
        engine.tracker().advance(raw.partition, raw.offset);
        Ok(())
    }

    async fn publish(
        &self,
        key: &str,
        version: u64,
        output: &str,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let Some(publisher) = self.engine.publisher() else {
            return Ok(());
        };
        if let Err(e) = publisher.publish(key, version, output).await {
            // Пока держим gate: committer не должен зафиксировать
            // мутацию без продвинутого offset'а.
            self.engine.mark_failed();
            token.cancel();
            return Err(e);
        }
        Ok(())
    }
}
