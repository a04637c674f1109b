//! Collaborators the engine consumes as opaque services: the file catalog,
//! the shared cache, the execution backend, the log sink and a clock.

use crate::cache_aside::CacheAside;
use crate::file_types::FileType;
use crate::sink::TaskLogRecord;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl FileId {
    /// Reads an id from an invocation value (a number or a numeric string).
    pub fn from_value(value: &Value) -> Option<FileId> {
        match value {
            Value::Number(n) => n.as_u64().map(FileId),
            Value::String(s) => s.trim().parse::<u64>().ok().map(FileId),
            _ => None,
        }
    }

    pub fn to_value(self) -> Value {
        Value::from(self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    ToCache,
    ToProvider,
    CacheNewer,
    ProviderNewer,
    Corrupted,
}

/// State of one file's local materialization in the shared cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub status: SyncStatus,
    pub accessed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OutputRegistration<'a> {
    pub task_id: &'a str,
    pub output_id: &'a str,
    pub name: String,
    pub path: PathBuf,
    pub file_type: FileType,
}

pub trait FileStore: Send + Sync {
    fn find(&self, id: FileId) -> Result<Option<FileRecord>>;

    /// Relative paths of the entries inside a collection.
    fn collection_entries(&self, id: FileId) -> Result<Vec<String>>;

    fn register_output(&self, output: &OutputRegistration<'_>) -> Result<FileId>;

    fn tag(&self, id: FileId, tags: &[String]) -> Result<()>;
}

pub trait CacheService: Send + Sync {
    fn entry(&self, id: FileId) -> Result<Option<CacheEntry>>;

    /// Syncs the file into the cache if needed and makes it visible at `dest`.
    /// Implementations update the entry's access time on every call.
    fn materialize(&self, file: &FileRecord, dest: &Path) -> Result<()>;

    fn erase(&self, id: FileId) -> Result<()>;
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn at_seconds(secs: i64) -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub trait LogSink: Send + Sync {
    fn append(&self, record: &TaskLogRecord) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardLogSink;

impl LogSink for DiscardLogSink {
    fn append(&self, _record: &TaskLogRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exit_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Where the backend captured the commands' standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,
}

impl ExecutionReport {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_status: Some(code),
            detail: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn with_streams(mut self, stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Runs the generated commands in a task's work directory.
pub trait ExecutionBackend {
    fn execute(&self, commands: &[String], work_dir: &Path) -> Result<ExecutionReport>;
}

pub struct Services {
    pub files: Arc<dyn FileStore>,
    pub cache: Arc<dyn CacheService>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn LogSink>,
    listings: CacheAside<FileId, Vec<String>>,
}

impl Services {
    pub fn new(
        files: Arc<dyn FileStore>,
        cache: Arc<dyn CacheService>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn LogSink>,
        listing_ttl: Duration,
        listing_grace: Duration,
    ) -> Self {
        let listings = CacheAside::new(listing_ttl, listing_grace, clock.clone());
        Self {
            files,
            cache,
            clock,
            sink,
            listings,
        }
    }

    pub fn file(&self, id: FileId) -> Result<FileRecord> {
        self.files
            .find(id)?
            .ok_or_else(|| anyhow!("no file found with id {}", id))
    }

    /// Collection listing, served through the listing cache.
    pub fn collection_entries(&self, id: FileId) -> Result<Arc<Vec<String>>> {
        self.listings
            .get_or_load(&id, || self.files.collection_entries(id))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_ids_parse_from_numbers_and_numeric_strings() {
        assert_eq!(FileId::from_value(&json!(12)), Some(FileId(12)));
        assert_eq!(FileId::from_value(&json!(" 7 ")), Some(FileId(7)));
        assert_eq!(FileId::from_value(&json!("seven")), None);
        assert_eq!(FileId::from_value(&json!(-1)), None);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::at_seconds(100);
        assert_eq!(clock.now().timestamp(), 100);
        clock.advance(Duration::seconds(50));
        assert_eq!(clock.now().timestamp(), 150);
    }
}
