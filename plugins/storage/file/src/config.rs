// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

#[derive(Debug, serde::Deserialize)]
pub struct FileStorageConfig {
    /// Корневая директория: `{data_dir}/{topic}/{partition}.jsonl`.
    pub data_dir: String,
    /// fsync после каждого append'а.
    #[serde(default)]
    pub fsync: bool,
}
