use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, StateStoreError};
use crate::store::Snapshot;

// ═══════════════════════════════════════════════════════════════
//  OffsetTracker
// ═══════════════════════════════════════════════════════════════

/// Прогресс потребления входного лога: партиция → следующий offset.
///
/// `advance` вызывается worker'ом после того, как мутация состояния от
/// записи применена к store'у. Offset'ы никогда не откатываются.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    offsets: Mutex<BTreeMap<u32, u64>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_offsets(offsets: BTreeMap<u32, u64>) -> Self {
        Self {
            offsets: Mutex::new(offsets),
        }
    }

    /// Отметить запись `offset` партиции обработанной.
    /// Возвращает false, если позиция уже была пройдена.
    pub fn advance(&self, partition: u32, offset: u64) -> bool {
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        let next = offsets.entry(partition).or_insert(0);
        if offset < *next {
            return false;
        }
        *next = offset + 1;
        true
    }

    /// Следующий offset для потребления (0 — с начала).
    pub fn current_offset(&self, partition: u32) -> u64 {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
            .copied()
            .unwrap_or(0)
    }

    pub fn offsets(&self) -> BTreeMap<u32, u64> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Заменить прогресс (восстановление из checkpoint'а).
    pub fn reset(&self, offsets: BTreeMap<u32, u64>) {
        *self.offsets.lock().unwrap_or_else(PoisonError::into_inner) = offsets;
    }
}

// ═══════════════════════════════════════════════════════════════
//  Checkpoint
// ═══════════════════════════════════════════════════════════════

/// Durable checkpoint: offset'ы и снимок состояния, которому они
/// соответствуют. Пишется одним атомарным файлом.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    /// Порядковый номер checkpoint'а.
    pub epoch: u64,
    pub ts_ms: i64,
    /// Партиция → следующий offset для потребления.
    pub offsets: BTreeMap<u32, u64>,
    pub state: Snapshot<S>,
}

impl<S: Serialize> Checkpoint<S> {
    pub fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<S: DeserializeOwned> Checkpoint<S> {
    pub fn decode(bytes: &[u8]) -> Result<Self, StateStoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Backend для хранения закодированного checkpoint'а.
pub trait CheckpointStore: Send + Sync {
    /// Атомарно заменить сохранённый checkpoint.
    fn save(&self, bytes: &[u8]) -> Result<(), CheckpointError>;

    /// Последний сохранённый checkpoint. None — ещё не было.
    fn load(&self) -> Result<Option<Vec<u8>>, StateStoreError>;

    /// Описание для логов.
    fn describe(&self) -> String;
}

// ═══════════════════════════════════════════════════════════════
//  FileCheckpointStore
// ═══════════════════════════════════════════════════════════════

/// `{dir}/checkpoint.json`, запись через временный файл + rename.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, bytes: &[u8]) -> Result<(), CheckpointError> {
        let persist = |path: &PathBuf, source: std::io::Error| CheckpointError::Persist {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| persist(&self.dir, e))?;
        let path = self.path();
        let tmp_path = self.dir.join("checkpoint.json.tmp");
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp_path).map_err(|e| persist(&tmp_path, e))?;
            f.write_all(bytes).map_err(|e| persist(&tmp_path, e))?;
            f.sync_all().map_err(|e| persist(&tmp_path, e))?;
        }
        std::fs::rename(&tmp_path, &path).map_err(|e| persist(&path, e))?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>, StateStoreError> {
        let path = self.path();
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateStoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path().display())
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryCheckpointStore
// ═══════════════════════════════════════════════════════════════

/// Checkpoint в памяти процесса: переживает перезапуск engine'а,
/// но не процесса.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    slot: Mutex<Option<Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, bytes: &[u8]) -> Result<(), CheckpointError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.to_vec());
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>, StateStoreError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FoldMode, SourcePosition, StateStore};

    #[test]
    fn tracker_never_regresses() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.current_offset(3), 0);
        assert!(tracker.advance(3, 0));
        assert!(tracker.advance(3, 5));
        assert!(!tracker.advance(3, 2));
        assert_eq!(tracker.current_offset(3), 6);
        assert_eq!(tracker.offsets(), BTreeMap::from([(3, 6)]));
    }

    #[test]
    fn file_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileCheckpointStore::new(dir.path().join("cp"));
        assert!(backend.load().unwrap().is_none());

        let store = StateStore::new(4, FoldMode::Idempotent, || 0u64);
        store.apply("user1", Some(SourcePosition { partition: 1, offset: 4 }), &(), |_, _, s| s + 1);
        let checkpoint = Checkpoint {
            epoch: 7,
            ts_ms: 1_700_000_000_000,
            offsets: BTreeMap::from([(0, 0), (1, 5)]),
            state: store.snapshot(),
        };
        backend.save(&checkpoint.encode().unwrap()).unwrap();

        let bytes = backend.load().unwrap().unwrap();
        let back: Checkpoint<u64> = Checkpoint::decode(&bytes).unwrap();
        assert_eq!(back, checkpoint);
        assert!(!dir.path().join("cp").join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn corrupt_checkpoint_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.json"), b"{\"epoch\":").unwrap();
        let backend = FileCheckpointStore::new(dir.path());
        let bytes = backend.load().unwrap().unwrap();
        let err = Checkpoint::<u64>::decode(&bytes).unwrap_err();
        assert!(matches!(err, StateStoreError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn unwritable_directory_fails_to_persist() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let backend = FileCheckpointStore::new(&blocker);
        let err = backend.save(b"{}").unwrap_err();
        assert!(matches!(err, CheckpointError::Persist { .. }));
    }
}
