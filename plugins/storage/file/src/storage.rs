use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use streamfold_api::{LogError, LogFuture, LogStorage, RawRecord};

// ════════════════════════════════════════════════════════════════
//  FileStorage
// ════════════════════════════════════════════════════════════════

/// Append-only JSONL storage одной партиции: одна строка — одна
/// `RawRecord` (payload в base64).
///
/// Недописанный хвост (crash посреди append'а) отрезается при `init`.
pub struct FileStorage {
    path: PathBuf,
    fsync: bool,
    /// Сериализует файловые операции партиции.
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Init ──

    fn do_init(&self) -> Result<u64, LogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LogError::io(format!("mkdir {}: {e}", parent.display())))?;
        }
        if !self.path.exists() {
            return Ok(0);
        }

        let content = std::fs::read(&self.path)
            .map_err(|e| LogError::io(format!("read {}: {e}", self.path.display())))?;

        let mut next_offset = 0;
        let mut good_len = 0usize;
        let mut pos = 0usize;
        while pos < content.len() {
            let Some(nl) = content[pos..].iter().position(|&b| b == b'\n') else {
                break;
            };
            let line = &content[pos..pos + nl];
            match serde_json::from_slice::<RawRecord>(line) {
                Ok(record) => {
                    next_offset = record.offset + 1;
                    pos += nl + 1;
                    good_len = pos;
                }
                Err(_) => break,
            }
        }

        if good_len < content.len() {
            tracing::warn!(
                path = %self.path.display(),
                dropped_bytes = content.len() - good_len,
                "truncating torn tail of log file"
            );
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(|e| LogError::io(format!("open {}: {e}", self.path.display())))?;
            f.set_len(good_len as u64)
                .map_err(|e| LogError::io(format!("truncate: {e}")))?;
        }

        Ok(next_offset)
    }

    // ── Append ──

    fn do_append(&self, records: &[RawRecord]) -> Result<(), LogError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| LogError::format_err(format!("json serialize: {e}")))?;
            buf.push(b'\n');
        }

        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::io(format!("open {}: {e}", self.path.display())))?;
        f.write_all(&buf)
            .map_err(|e| LogError::io(format!("write: {e}")))?;
        if self.fsync {
            f.sync_data().map_err(|e| LogError::io(format!("fsync: {e}")))?;
        }
        Ok(())
    }

    // ── Read ──

    fn do_read(&self, from_offset: u64, limit: Option<usize>) -> Result<Vec<RawRecord>, LogError> {
        let f = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LogError::io(format!("open {}: {e}", self.path.display()))),
        };

        let limit = limit.unwrap_or(usize::MAX);
        let mut result = Vec::new();
        for line in BufReader::new(f).lines() {
            if result.len() >= limit {
                break;
            }
            let line = line.map_err(|e| LogError::io(format!("read line: {e}")))?;
            if line.is_empty() {
                continue;
            }
            let record: RawRecord = serde_json::from_str(&line)
                .map_err(|e| LogError::format_err(format!("parse json: {e}")))?;
            if record.offset >= from_offset {
                result.push(record);
            }
        }
        Ok(result)
    }
}

impl LogStorage for FileStorage {
    fn init(&self) -> LogFuture<'_, u64> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.do_init()
        })
    }

    fn append(&self, records: &[RawRecord]) -> LogFuture<'_, ()> {
        let records = records.to_vec();
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.do_append(&records)
        })
    }

    fn read(&self, from_offset: u64, limit: Option<usize>) -> LogFuture<'_, Vec<RawRecord>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.do_read(from_offset, limit)
        })
    }

    fn flush(&self) -> LogFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            if !self.path.exists() {
                return Ok(());
            }
            let f = std::fs::OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map_err(|e| LogError::io(format!("open {}: {e}", self.path.display())))?;
            f.sync_all().map_err(|e| LogError::io(format!("fsync: {e}")))
        })
    }
}
