//! In-memory collaborators for dry runs and tests.

use crate::file_types::FileType;
use crate::services::{
    CacheEntry, CacheService, Clock, FileId, FileRecord, FileStore, OutputRegistration,
    SyncStatus,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use mill_core::ensure_dir;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredOutput {
    pub id: FileId,
    pub task_id: String,
    pub output_id: String,
    pub name: String,
    pub path: PathBuf,
    pub file_type: FileType,
}

#[derive(Default)]
struct StoreState {
    files: BTreeMap<FileId, FileRecord>,
    collections: BTreeMap<FileId, Vec<String>>,
    tags: BTreeMap<FileId, Vec<String>>,
    outputs: Vec<RegisteredOutput>,
    listing_calls: usize,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryFileStore {
    state: Mutex<StoreState>,
}

/// One entry of a files manifest (`[{"id": 1, "name": "...", "type": "...", "entries": [...]}]`).
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type", default = "default_manifest_type")]
    pub file_type: String,
    #[serde(default)]
    pub entries: Vec<String>,
}

fn default_manifest_type() -> String {
    FileType::SingleFile.as_str().to_string()
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_manifest(files: &[ManifestFile]) -> Result<Self> {
        let store = Self::new();
        for file in files {
            let file_type = FileType::from_name(&file.file_type).ok_or_else(|| {
                anyhow!(
                    "unknown file type '{}' for file {}; supported: {}",
                    file.file_type,
                    file.id,
                    FileType::supported_names().join(", ")
                )
            })?;
            store.add_file(FileId(file.id), &file.name, file_type);
            if !file.entries.is_empty() {
                store.set_collection_entries(FileId(file.id), file.entries.clone());
            }
        }
        Ok(store)
    }

    pub fn add_file(&self, id: FileId, name: &str, file_type: FileType) {
        let mut state = self.lock();
        state.files.insert(
            id,
            FileRecord {
                id,
                name: name.to_string(),
                file_type,
            },
        );
        state.next_id = state.next_id.max(id.0 + 1);
    }

    pub fn set_collection_entries(&self, id: FileId, entries: Vec<String>) {
        self.lock().collections.insert(id, entries);
    }

    pub fn tags_of(&self, id: FileId) -> Vec<String> {
        self.lock().tags.get(&id).cloned().unwrap_or_default()
    }

    pub fn outputs(&self) -> Vec<RegisteredOutput> {
        self.lock().outputs.clone()
    }

    pub fn listing_calls(&self) -> usize {
        self.lock().listing_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FileStore for MemoryFileStore {
    fn find(&self, id: FileId) -> Result<Option<FileRecord>> {
        Ok(self.lock().files.get(&id).cloned())
    }

    fn collection_entries(&self, id: FileId) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.listing_calls += 1;
        state
            .collections
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("file {} is not a collection", id))
    }

    fn register_output(&self, output: &OutputRegistration<'_>) -> Result<FileId> {
        let mut state = self.lock();
        let id = FileId(state.next_id.max(1));
        state.next_id = id.0 + 1;
        state.files.insert(
            id,
            FileRecord {
                id,
                name: output.name.clone(),
                file_type: output.file_type,
            },
        );
        state.outputs.push(RegisteredOutput {
            id,
            task_id: output.task_id.to_string(),
            output_id: output.output_id.to_string(),
            name: output.name.clone(),
            path: output.path.clone(),
            file_type: output.file_type,
        });
        Ok(id)
    }

    fn tag(&self, id: FileId, tags: &[String]) -> Result<()> {
        let mut state = self.lock();
        if !state.files.contains_key(&id) {
            return Err(anyhow!("cannot tag unknown file {}", id));
        }
        let current = state.tags.entry(id).or_default();
        for tag in tags {
            if !current.contains(tag) {
                current.push(tag.clone());
            }
        }
        Ok(())
    }
}

/// A cache whose entries live in memory; materializing writes an empty
/// placeholder (a directory for collections) at the destination.
pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<FileId, CacheEntry>>,
    erased: Mutex<Vec<FileId>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
            erased: Mutex::new(Vec::new()),
        }
    }

    pub fn set_entry(&self, id: FileId, status: SyncStatus, accessed_at: Option<DateTime<Utc>>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                CacheEntry {
                    status,
                    accessed_at,
                },
            );
    }

    pub fn erased(&self) -> Vec<FileId> {
        self.erased.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CacheService for MemoryCache {
    fn entry(&self, id: FileId) -> Result<Option<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    fn materialize(&self, file: &FileRecord, dest: &Path) -> Result<()> {
        if file.file_type.is_a(FileType::FileCollection) {
            ensure_dir(dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                ensure_dir(parent)?;
            }
            if !dest.exists() {
                fs::write(dest, b"")?;
            }
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(file.id).or_insert(CacheEntry {
            status: SyncStatus::InSync,
            accessed_at: None,
        });
        entry.status = SyncStatus::InSync;
        entry.accessed_at = Some(now);
        Ok(())
    }

    fn erase(&self, id: FileId) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.erased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
        Ok(())
    }
}

/// Services over in-memory doubles, keeping typed handles for assertions.
#[cfg(test)]
pub(crate) struct TestRig {
    pub store: Arc<MemoryFileStore>,
    pub cache: Arc<MemoryCache>,
    pub clock: Arc<crate::services::ManualClock>,
    pub services: crate::services::Services,
}

#[cfg(test)]
pub(crate) fn test_rig() -> TestRig {
    use crate::services::{DiscardLogSink, ManualClock};
    let clock = Arc::new(ManualClock::at_seconds(1_000));
    let store = Arc::new(MemoryFileStore::new());
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let services = crate::services::Services::new(
        store.clone(),
        cache.clone(),
        clock.clone(),
        Arc::new(DiscardLogSink),
        chrono::Duration::seconds(60),
        chrono::Duration::seconds(5),
    );
    TestRig {
        store,
        cache,
        clock,
        services,
    }
}

#[cfg(test)]
pub(crate) fn test_services() -> crate::services::Services {
    test_rig().services
}

#[cfg(test)]
pub(crate) struct TempDirGuard {
    pub path: PathBuf,
}

#[cfg(test)]
impl TempDirGuard {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&path).expect("temp dir");
        Self { path }
    }
}

#[cfg(test)]
impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
