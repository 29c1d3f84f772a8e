//! Delivery ledger
//!
//! Append-only record of every dispatch attempt, keyed by (post id, platform).
//! When backed by a file the whole log is rewritten through a temporary file in
//! the same directory and renamed into place, so a crash mid-write leaves the
//! previous log intact.
//!
//! File format:
//! ```json
//! { "records": [ { "record_id": "post-1-mastodon", "post_id": "post-1", ... } ] }
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failure,
    /// Never written by this crate; accepted when loading older logs
    Skipped,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Success => write!(f, "success"),
            DeliveryStatus::Failure => write!(f, "failure"),
            DeliveryStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One dispatch attempt for one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub record_id: String,
    pub post_id: String,
    pub platform: String,
    pub status: DeliveryStatus,
    /// RFC 3339 timestamp
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DeliveryRecord {
    pub fn success(post_id: &str, platform: &str, external_url: Option<String>) -> Self {
        Self::new(post_id, platform, DeliveryStatus::Success, external_url, None)
    }

    pub fn failure(post_id: &str, platform: &str, error: impl Into<String>) -> Self {
        Self::new(
            post_id,
            platform,
            DeliveryStatus::Failure,
            None,
            Some(error.into()),
        )
    }

    fn new(
        post_id: &str,
        platform: &str,
        status: DeliveryStatus,
        external_url: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            record_id: format!("{}-{}", post_id, platform),
            post_id: post_id.to_string(),
            platform: platform.to_string(),
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
            external_url,
            error,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    records: Vec<DeliveryRecord>,
}

/// Durable, deduplicating delivery log
#[derive(Debug)]
pub struct DeliveryLedger {
    path: Option<PathBuf>,
    max_records: Option<usize>,
    records: Mutex<Vec<DeliveryRecord>>,
}

impl DeliveryLedger {
    /// Ledger with no backing file
    pub fn in_memory() -> Self {
        Self {
            path: None,
            max_records: None,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Open a file-backed ledger, loading existing records
    ///
    /// A missing file starts empty. An unreadable or malformed file is logged
    /// and also starts empty; it is overwritten on the next append.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = load_records(&path);
        debug!(path = %path.display(), records = records.len(), "delivery ledger loaded");

        Self {
            path: Some(path),
            max_records: None,
            records: Mutex::new(records),
        }
    }

    /// Bound the number of retained records; oldest are evicted first
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        let records = self.records.get_mut().unwrap_or_else(|e| e.into_inner());
        trim_oldest(records, Some(max_records));
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn max_records(&self) -> Option<usize> {
        self.max_records
    }

    /// Append a record and persist the log
    ///
    /// The in-memory view only changes once the file has been replaced, so a
    /// failed write leaves the ledger as it was. Writers are serialised.
    pub fn append(&self, record: DeliveryRecord) -> Result<()> {
        let mut records = self.lock();

        let mut next = records.clone();
        next.push(record);
        trim_oldest(&mut next, self.max_records);

        if let Some(path) = &self.path {
            write_atomic(path, &next)?;
        }

        *records = next;
        Ok(())
    }

    /// [`append`](Self::append) from async code
    ///
    /// File-backed ledgers write on the blocking thread pool so the fsync
    /// and rename never stall a runtime worker.
    pub async fn append_async(self: Arc<Self>, record: DeliveryRecord) -> Result<()> {
        if self.path.is_none() {
            return self.append(record);
        }
        tokio::task::spawn_blocking(move || self.append(record))
            .await
            .map_err(LedgerError::from)?
    }

    /// True iff a success record exists for the pair
    pub fn has_been_delivered(&self, post_id: &str, platform: &str) -> bool {
        self.lock().iter().any(|r| {
            r.post_id == post_id && r.platform == platform && r.status == DeliveryStatus::Success
        })
    }

    pub fn failures(&self) -> Vec<DeliveryRecord> {
        self.filtered(|r| r.status == DeliveryStatus::Failure)
    }

    pub fn by_post(&self, post_id: &str) -> Vec<DeliveryRecord> {
        self.filtered(|r| r.post_id == post_id)
    }

    pub fn by_platform(&self, platform: &str) -> Vec<DeliveryRecord> {
        self.filtered(|r| r.platform == platform)
    }

    pub fn all_records(&self) -> Vec<DeliveryRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn filtered(&self, keep: impl Fn(&DeliveryRecord) -> bool) -> Vec<DeliveryRecord> {
        self.lock().iter().filter(|r| keep(r)).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeliveryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_records(path: &Path) -> Vec<DeliveryRecord> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read delivery ledger, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_str::<LedgerFile>(&content) {
        Ok(file) => file.records,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed delivery ledger, starting empty");
            Vec::new()
        }
    }
}

fn trim_oldest(records: &mut Vec<DeliveryRecord>, max_records: Option<usize>) {
    if let Some(max) = max_records {
        if records.len() > max {
            let excess = records.len() - max;
            records.drain(..excess);
        }
    }
}

fn write_atomic(path: &Path, records: &[DeliveryRecord]) -> std::result::Result<(), LedgerError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let body = serde_json::to_string_pretty(&LedgerFileRef { records })?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[derive(Serialize)]
struct LedgerFileRef<'a> {
    records: &'a [DeliveryRecord],
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_id_derived_from_post_and_platform() {
        let record = DeliveryRecord::success("post-1", "mastodon", None);
        assert_eq!(record.record_id, "post-1-mastodon");
        assert!(chrono::DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }

    #[test]
    fn test_has_been_delivered_requires_success() {
        let ledger = DeliveryLedger::in_memory();
        ledger
            .append(DeliveryRecord::failure("p1", "discord", "500"))
            .unwrap();
        assert!(!ledger.has_been_delivered("p1", "discord"));

        ledger
            .append(DeliveryRecord::success(
                "p1",
                "discord",
                Some("https://discord.example/1".to_string()),
            ))
            .unwrap();
        assert!(ledger.has_been_delivered("p1", "discord"));
        assert!(!ledger.has_been_delivered("p1", "mastodon"));
        assert!(!ledger.has_been_delivered("p2", "discord"));
    }

    #[test]
    fn test_filtered_views() {
        let ledger = DeliveryLedger::in_memory();
        ledger.append(DeliveryRecord::success("p1", "mastodon", None)).unwrap();
        ledger.append(DeliveryRecord::failure("p1", "discord", "timeout")).unwrap();
        ledger.append(DeliveryRecord::success("p2", "discord", None)).unwrap();

        assert_eq!(ledger.failures().len(), 1);
        assert_eq!(ledger.failures()[0].error.as_deref(), Some("timeout"));
        assert_eq!(ledger.by_post("p1").len(), 2);
        assert_eq!(ledger.by_platform("discord").len(), 2);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_persists_and_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delivery_log.json");

        let ledger = DeliveryLedger::open(&path);
        assert!(ledger.is_empty());
        ledger
            .append(
                DeliveryRecord::success("p1", "mastodon", Some("https://m.example/1".into()))
                    .with_metadata("thread_length", serde_json::json!(2)),
            )
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["records"][0]["status"], "success");
        assert_eq!(raw["records"][0]["record_id"], "p1-mastodon");

        let reloaded = DeliveryLedger::open(&path);
        assert!(reloaded.has_been_delivered("p1", "mastodon"));
        assert_eq!(
            reloaded.all_records()[0].metadata["thread_length"],
            serde_json::json!(2)
        );
    }

    #[test]
    fn test_malformed_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delivery_log.json");
        std::fs::write(&path, "{ not json").unwrap();

        let ledger = DeliveryLedger::open(&path);
        assert!(ledger.is_empty());

        ledger.append(DeliveryRecord::success("p1", "discord", None)).unwrap();
        assert_eq!(DeliveryLedger::open(&path).len(), 1);
    }

    #[test]
    fn test_tolerates_skipped_and_missing_fields_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delivery_log.json");
        std::fs::write(
            &path,
            r#"{"records": [
                {"record_id": "a-x", "post_id": "a", "platform": "x", "status": "skipped"},
                {"record_id": "b-x", "post_id": "b", "platform": "x", "status": "success",
                 "timestamp": "2024-01-01T00:00:00+00:00", "external_url": null, "error": null}
            ]}"#,
        )
        .unwrap();

        let ledger = DeliveryLedger::open(&path);
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.has_been_delivered("a", "x"));
        assert!(ledger.has_been_delivered("b", "x"));
    }

    #[test]
    fn test_max_records_evicts_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delivery_log.json");
        let ledger = DeliveryLedger::open(&path).with_max_records(3);

        for i in 1..=5 {
            ledger
                .append(DeliveryRecord::success(&format!("post-{}", i), "mastodon", None))
                .unwrap();
        }

        assert_eq!(ledger.len(), 3);
        assert!(ledger.by_post("post-1").is_empty());
        assert!(ledger.by_post("post-2").is_empty());
        assert_eq!(ledger.by_post("post-5").len(), 1);
        assert_eq!(DeliveryLedger::open(&path).len(), 3);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        // A directory at the ledger path makes the rename fail.
        let path = temp_dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        let ledger = DeliveryLedger::open(&path);
        let result = ledger.append(DeliveryRecord::success("p1", "discord", None));

        assert!(result.is_err());
        assert!(ledger.is_empty());
        assert!(!ledger.has_been_delivered("p1", "discord"));
    }

    #[tokio::test]
    async fn test_append_async_persists_off_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delivery_log.json");
        let ledger = std::sync::Arc::new(DeliveryLedger::open(&path));

        ledger
            .clone()
            .append_async(DeliveryRecord::success("p1", "ghost", None))
            .await
            .unwrap();

        assert!(ledger.has_been_delivered("p1", "ghost"));
        assert!(DeliveryLedger::open(&path).has_been_delivered("p1", "ghost"));
    }

    #[tokio::test]
    async fn test_append_async_reports_write_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        let ledger = std::sync::Arc::new(DeliveryLedger::open(&path));
        let result = ledger
            .clone()
            .append_async(DeliveryRecord::success("p1", "ghost", None))
            .await;

        assert!(result.is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_concurrent_appends_are_all_kept() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("delivery_log.json");
        let ledger = std::sync::Arc::new(DeliveryLedger::open(&path));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger
                        .append(DeliveryRecord::success(&format!("p{}", i), "discord", None))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.len(), 8);
        assert_eq!(DeliveryLedger::open(&path).len(), 8);
    }
}
