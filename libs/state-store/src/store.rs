use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════

/// Как store обращается с повторно доставленными записями.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldMode {
    /// Запись с позицией не выше уже применённой для (key, partition)
    /// пропускается: повтор после replay не меняет состояние.
    #[default]
    Idempotent,
    /// Каждая доставка сворачивается. Replay после crash'а
    /// пересчитывает записи между checkpoint'ом и точкой падения.
    AtLeastOnce,
}

/// Позиция записи во входном логе.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub partition: u32,
    pub offset: u64,
}

/// Состояние ключа вместе с версией (числом применённых fold'ов).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<S> {
    pub version: u64,
    pub state: S,
}

/// Результат `apply`.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<S> {
    pub state: S,
    pub version: u64,
    /// Запись уже была применена — состояние не изменилось.
    pub duplicate: bool,
}

/// Запись store'а: состояние, версия и high-water mark применённых
/// offset'ов по партициям-источникам.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry<S> {
    pub version: u64,
    pub state: S,
    #[serde(default)]
    pub applied: BTreeMap<u32, u64>,
}

/// Полный снимок store'а.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub entries: BTreeMap<String, SnapshotEntry<S>>,
}

impl<S> Default for Snapshot<S> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

type Slot<S> = Arc<Mutex<SnapshotEntry<S>>>;
type Shard<S> = RwLock<HashMap<String, Slot<S>>>;

// ═══════════════════════════════════════════════════════════════
//  StateStore
// ═══════════════════════════════════════════════════════════════

/// Партиционированное отображение key → aggregate state.
///
/// Ключи распределены по shard'ам; shard lock держится только на время
/// поиска/вставки слота. Read-modify-write ключа идёт под mutex'ом
/// его слота, поэтому fold'ы одного ключа сериализованы, а разных
/// ключей — независимы.
pub struct StateStore<S> {
    shards: Box<[Shard<S>]>,
    init: Box<dyn Fn() -> S + Send + Sync>,
    mode: FoldMode,
}

impl<S: Clone> StateStore<S> {
    /// `init` — нулевое значение, создаваемое при первой записи ключа.
    pub fn new(shards: usize, mode: FoldMode, init: impl Fn() -> S + Send + Sync + 'static) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            init: Box::new(init),
            mode,
        }
    }

    pub fn mode(&self) -> FoldMode {
        self.mode
    }

    fn shard(&self, key: &str) -> &Shard<S> {
        let idx = fnv1a(key.as_bytes()) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn existing_slot(&self, key: &str) -> Option<Slot<S>> {
        self.shard(key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn slot(&self, key: &str) -> Slot<S> {
        if let Some(slot) = self.existing_slot(key) {
            return slot;
        }
        let mut map = self.shard(key).write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SnapshotEntry {
                    version: 0,
                    state: (self.init)(),
                    applied: BTreeMap::new(),
                }))
            })
            .clone()
    }

    /// Свернуть запись в состояние ключа.
    ///
    /// `position` — откуда пришла запись; в `Idempotent` режиме по ней
    /// отсекаются повторы. Без позиции запись сворачивается всегда.
    pub fn apply<R: ?Sized>(
        &self,
        key: &str,
        position: Option<SourcePosition>,
        record: &R,
        fold: impl FnOnce(&str, &R, S) -> S,
    ) -> Applied<S> {
        let slot = self.slot(key);
        let mut entry = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let (FoldMode::Idempotent, Some(pos)) = (self.mode, position) {
            if entry.applied.get(&pos.partition).is_some_and(|&last| pos.offset <= last) {
                return Applied {
                    state: entry.state.clone(),
                    version: entry.version,
                    duplicate: true,
                };
            }
        }

        entry.state = fold(key, record, entry.state.clone());
        entry.version += 1;
        if let Some(pos) = position {
            let hwm = entry.applied.entry(pos.partition).or_insert(pos.offset);
            *hwm = (*hwm).max(pos.offset);
        }

        Applied {
            state: entry.state.clone(),
            version: entry.version,
            duplicate: false,
        }
    }

    /// Точечное чтение. Блокирует только на время копирования состояния.
    pub fn get(&self, key: &str) -> Option<Versioned<S>> {
        let slot = self.existing_slot(key)?;
        let entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if entry.version == 0 {
            return None;
        }
        Some(Versioned {
            version: entry.version,
            state: entry.state.clone(),
        })
    }

    /// Количество ключей.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Все ключи, отсортированные.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Снимок всех ключей. Согласованность между ключами обеспечивает
    /// вызывающий (engine держит commit gate на время снимка).
    pub fn snapshot(&self) -> Snapshot<S> {
        let mut entries = BTreeMap::new();
        for shard in self.shards.iter() {
            let slots: Vec<(String, Slot<S>)> = shard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, slot) in slots {
                let entry = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
                if entry.version > 0 {
                    entries.insert(key, entry);
                }
            }
        }
        Snapshot { entries }
    }

    /// Заменить содержимое store'а снимком.
    pub fn restore(&self, snapshot: Snapshot<S>) {
        for shard in self.shards.iter() {
            shard.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
        for (key, entry) in snapshot.entries {
            self.shard(&key)
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, Arc::new(Mutex::new(entry)));
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(_key: &str, _record: &(), state: u64) -> u64 {
        state + 1
    }

    fn sum(_key: &str, record: &u64, state: u64) -> u64 {
        state + record
    }

    fn at(partition: u32, offset: u64) -> Option<SourcePosition> {
        Some(SourcePosition { partition, offset })
    }

    #[test]
    fn first_record_initializes_then_folds() {
        let store = StateStore::new(4, FoldMode::Idempotent, || 100u64);
        assert!(store.get("a").is_none());

        let applied = store.apply("a", at(0, 0), &5, sum);
        assert_eq!(applied, Applied { state: 105, version: 1, duplicate: false });
        let applied = store.apply("a", at(0, 1), &7, sum);
        assert_eq!(applied.state, 112);
        assert_eq!(store.get("a"), Some(Versioned { version: 2, state: 112 }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn replay_double_counts_in_at_least_once_mode() {
        // Записи 0..5 свёрнуты, durable checkpoint остался на offset 3,
        // после crash'а лог переигрывается с 3.
        let naive = StateStore::new(4, FoldMode::AtLeastOnce, || 0u64);
        let dedup = StateStore::new(4, FoldMode::Idempotent, || 0u64);
        for store in [&naive, &dedup] {
            for offset in 0..5 {
                store.apply("user1", at(0, offset), &(), count);
            }
            for offset in 3..5 {
                store.apply("user1", at(0, offset), &(), count);
            }
        }

        assert_eq!(naive.get("user1").unwrap().state, 7);
        assert_eq!(dedup.get("user1").unwrap().state, 5);
    }

    #[test]
    fn duplicates_are_tracked_per_partition() {
        let store = StateStore::new(4, FoldMode::Idempotent, || 0u64);
        store.apply("k", at(0, 10), &(), count);
        // тот же offset в другой партиции — другая запись
        assert!(!store.apply("k", at(1, 10), &(), count).duplicate);
        let again = store.apply("k", at(0, 10), &(), count);
        assert!(again.duplicate);
        assert_eq!(again.version, 2);
        // без позиции — всегда сворачивается
        assert!(!store.apply("k", None, &(), count).duplicate);
        assert_eq!(store.get("k").unwrap().state, 3);
    }

    #[test]
    fn concurrent_folds_on_one_key_never_lose_updates() {
        let store = StateStore::new(8, FoldMode::AtLeastOnce, || 0u64);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        store.apply("hot", None, &(), count);
                    }
                });
            }
        });
        assert_eq!(store.get("hot"), Some(Versioned { version: 8000, state: 8000 }));
    }

    #[test]
    fn disjoint_keys_concurrently_match_sequential() {
        let keys: Vec<String> = (0..16).map(|i| format!("station-{i}")).collect();

        let sequential = StateStore::new(4, FoldMode::Idempotent, || 0u64);
        for (i, key) in keys.iter().enumerate() {
            for offset in 0..200u64 {
                sequential.apply(key, at(i as u32, offset), &offset, sum);
            }
        }

        let concurrent = StateStore::new(4, FoldMode::Idempotent, || 0u64);
        std::thread::scope(|s| {
            for (i, key) in keys.iter().enumerate() {
                let store = &concurrent;
                s.spawn(move || {
                    for offset in 0..200u64 {
                        store.apply(key, at(i as u32, offset), &offset, sum);
                    }
                });
            }
        });

        assert_eq!(concurrent.snapshot(), sequential.snapshot());
        assert_eq!(concurrent.keys(), sequential.keys());
    }

    #[test]
    fn restore_keeps_versions_and_dedup_marks() {
        let store = StateStore::new(2, FoldMode::Idempotent, || 0u64);
        for offset in 0..3 {
            store.apply("a", at(0, offset), &(), count);
        }
        store.apply("b", at(1, 0), &(), count);
        let snapshot = store.snapshot();

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = StateStore::new(8, FoldMode::Idempotent, || 0u64);
        restored.apply("stale", None, &(), count);
        restored.restore(serde_json::from_str(&json).unwrap());

        assert!(restored.get("stale").is_none());
        assert_eq!(restored.get("a"), Some(Versioned { version: 3, state: 3 }));
        assert!(restored.apply("a", at(0, 2), &(), count).duplicate);
        assert!(!restored.apply("a", at(0, 3), &(), count).duplicate);
    }
}
