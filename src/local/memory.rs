//! In-process device calendar with optional JSON persistence.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{LocalEvent, LocalEventFields, LocalStore};
use crate::error::{SyncError, SyncResult};
use crate::window::DateWindow;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEvent {
    fields: LocalEventFields,
    #[serde(default)]
    deleted_occurrences: BTreeSet<NaiveDate>,
    #[serde(default)]
    occurrence_overrides: BTreeMap<NaiveDate, LocalEventFields>,
}

/// A [`LocalStore`] kept in memory and, when opened from a path, mirrored to a JSON file
/// after every write.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    events: Mutex<BTreeMap<String, StoredEvent>>,
    path: Option<PathBuf>,
    mutations: AtomicUsize,
    unavailable: AtomicBool,
    failing_titles: Mutex<HashSet<String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path` if it exists; writes go back to the same file.
    pub async fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let events = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            events: Mutex::new(events),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Number of write calls (create/update/delete and the occurrence operations) received.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Simulate the device store refusing all access.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes touching items with this title fail.
    pub fn fail_writes_for(&self, title: &str) {
        self.failing_titles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(title.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.failing_titles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn get(&self, local_id: &str) -> Option<LocalEvent> {
        self.lock().get(local_id).map(|stored| LocalEvent {
            id: local_id.to_string(),
            fields: stored.fields.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn deleted_occurrences(&self, local_id: &str) -> Vec<NaiveDate> {
        self.lock()
            .get(local_id)
            .map(|s| s.deleted_occurrences.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn occurrence_override(&self, local_id: &str, occurrence: NaiveDate) -> Option<LocalEventFields> {
        self.lock()
            .get(local_id)
            .and_then(|s| s.occurrence_overrides.get(&occurrence).cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::LocalStore("calendar access denied".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, title: &str) -> SyncResult<()> {
        self.check_available()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_titles.lock().unwrap_or_else(|e| e.into_inner());
        if failing.contains(title) {
            return Err(SyncError::Internal(anyhow::anyhow!(
                "local write rejected for '{title}'"
            )));
        }
        Ok(())
    }

    /// Apply `edit` to an existing item, then persist.
    async fn modify<F>(&self, local_id: &str, edit: F) -> SyncResult<()>
    where
        F: FnOnce(&mut StoredEvent) -> SyncResult<()>,
    {
        let title = self
            .lock()
            .get(local_id)
            .map(|s| s.fields.title.clone())
            .unwrap_or_default();
        self.check_writable(&title)?;
        {
            let mut events = self.lock();
            let stored = events
                .get_mut(local_id)
                .ok_or_else(|| SyncError::NotFound(format!("local event '{local_id}'")))?;
            edit(stored)?;
        }
        self.persist().await
    }

    async fn persist(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(&*self.lock())?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, raw).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn query(&self, window: &DateWindow) -> SyncResult<Vec<LocalEvent>> {
        self.check_available()?;
        let window_end = window.end_utc();
        let mut found: Vec<LocalEvent> = self
            .lock()
            .iter()
            .filter(|(_, stored)| {
                let f = &stored.fields;
                if f.recurrence_rule.is_some() {
                    f.start < window_end && f.recurrence_end.is_none_or(|end| end > window.from)
                } else {
                    window.overlaps(f.start, f.end)
                }
            })
            .map(|(id, stored)| LocalEvent {
                id: id.clone(),
                fields: stored.fields.clone(),
            })
            .collect();
        found.sort_by(|a, b| {
            a.fields
                .start
                .cmp(&b.fields.start)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found)
    }

    async fn create(&self, fields: &LocalEventFields) -> SyncResult<String> {
        self.check_writable(&fields.title)?;
        let id = Uuid::new_v4().to_string();
        self.lock().insert(
            id.clone(),
            StoredEvent {
                fields: fields.clone(),
                deleted_occurrences: BTreeSet::new(),
                occurrence_overrides: BTreeMap::new(),
            },
        );
        self.persist().await?;
        Ok(id)
    }

    async fn update(&self, local_id: &str, fields: &LocalEventFields) -> SyncResult<()> {
        let fields = fields.clone();
        self.modify(local_id, move |stored| {
            stored.fields = fields;
            Ok(())
        })
        .await
    }

    async fn delete(&self, local_id: &str) -> SyncResult<()> {
        let title = self
            .lock()
            .get(local_id)
            .map(|s| s.fields.title.clone())
            .unwrap_or_default();
        self.check_writable(&title)?;
        if self.lock().remove(local_id).is_none() {
            return Err(SyncError::NotFound(format!("local event '{local_id}'")));
        }
        self.persist().await
    }

    async fn delete_occurrence(&self, local_id: &str, occurrence: NaiveDate) -> SyncResult<()> {
        self.modify(local_id, |stored| {
            stored.occurrence_overrides.remove(&occurrence);
            stored.deleted_occurrences.insert(occurrence);
            Ok(())
        })
        .await
    }

    async fn end_recurrence_at(&self, local_id: &str, date: NaiveDate) -> SyncResult<()> {
        self.modify(local_id, |stored| {
            if stored.fields.recurrence_rule.is_none() {
                return Err(SyncError::InvalidData(format!(
                    "local event '{local_id}' is not recurring"
                )));
            }
            stored.fields.recurrence_end = Some(date);
            Ok(())
        })
        .await
    }

    async fn update_occurrence(
        &self,
        local_id: &str,
        occurrence: NaiveDate,
        fields: &LocalEventFields,
    ) -> SyncResult<()> {
        let fields = fields.clone();
        self.modify(local_id, move |stored| {
            stored.deleted_occurrences.remove(&occurrence);
            stored.occurrence_overrides.insert(occurrence, fields);
            Ok(())
        })
        .await
    }
}
