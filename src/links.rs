//! Device-local bookkeeping tying remote events to their local copies.
//!
//! Kept apart from attendee rows on purpose: when the remote store cascades an
//! event deletion into its attendee rows, this is the only record left of which
//! local item has to go.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SyncResult;

const EVENT_LINKS_FILE: &str = "event_links.json";
const EVENT_SYNCED_FILE: &str = "event_synced_at.json";
const EXCEPTION_SYNCED_FILE: &str = "exception_synced_at.json";
const RECURRENCE_END_FILE: &str = "recurrence_end_dates.json";

/// The four maps, each persisted as its own flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMaps {
    /// remote event id → local identifier
    pub event_links: BTreeMap<String, String>,
    /// remote event id → `updated_at` last pushed to the local copy
    pub event_synced_at: BTreeMap<String, DateTime<Utc>>,
    /// exception id → `updated_at` last applied to the local series
    pub exception_synced_at: BTreeMap<String, DateTime<Utc>>,
    /// remote event id → recurrence end date last pushed
    pub recurrence_end_dates: BTreeMap<String, NaiveDate>,
}

/// Persistent link store. All methods take `&self`; writes are buffered until [`flush`](Self::flush).
#[derive(Debug, Default)]
pub struct LinkStore {
    dir: Option<PathBuf>,
    state: Mutex<LinkState>,
}

#[derive(Debug, Default)]
struct LinkState {
    maps: LinkMaps,
    dirty: bool,
}

impl LinkStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or start) a store persisted under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let maps = LinkMaps {
            event_links: read_map(&dir.join(EVENT_LINKS_FILE)).await?,
            event_synced_at: read_map(&dir.join(EVENT_SYNCED_FILE)).await?,
            exception_synced_at: read_map(&dir.join(EXCEPTION_SYNCED_FILE)).await?,
            recurrence_end_dates: read_map(&dir.join(RECURRENCE_END_FILE)).await?,
        };
        Ok(Self {
            dir: Some(dir),
            state: Mutex::new(LinkState { maps, dirty: false }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of every map.
    pub fn snapshot(&self) -> LinkMaps {
        self.lock().maps.clone()
    }

    pub fn local_id(&self, event_id: &str) -> Option<String> {
        self.lock().maps.event_links.get(event_id).cloned()
    }

    /// All `(remote id, local id)` pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        self.lock()
            .maps
            .event_links
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Local identifiers that are copies of remote events.
    pub fn linked_local_ids(&self) -> HashSet<String> {
        self.lock().maps.event_links.values().cloned().collect()
    }

    pub fn link(&self, event_id: &str, local_id: &str) {
        let mut state = self.lock();
        if state.maps.event_links.get(event_id).map(String::as_str) != Some(local_id) {
            state
                .maps
                .event_links
                .insert(event_id.to_string(), local_id.to_string());
            state.dirty = true;
        }
    }

    /// Forget an event entirely: its link, sync time and cached end date.
    pub fn unlink(&self, event_id: &str) {
        let mut state = self.lock();
        let removed = state.maps.event_links.remove(event_id).is_some()
            | state.maps.event_synced_at.remove(event_id).is_some()
            | state.maps.recurrence_end_dates.remove(event_id).is_some();
        state.dirty |= removed;
    }

    /// Forget every event linked to `local_id`. Returns the remote ids dropped.
    pub fn unlink_local(&self, local_id: &str) -> Vec<String> {
        let event_ids: Vec<String> = self
            .lock()
            .maps
            .event_links
            .iter()
            .filter(|(_, v)| v.as_str() == local_id)
            .map(|(k, _)| k.clone())
            .collect();
        for id in &event_ids {
            self.unlink(id);
        }
        event_ids
    }

    pub fn event_synced_at(&self, event_id: &str) -> Option<DateTime<Utc>> {
        self.lock().maps.event_synced_at.get(event_id).copied()
    }

    pub fn set_event_synced_at(&self, event_id: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        if state.maps.event_synced_at.insert(event_id.to_string(), at) != Some(at) {
            state.dirty = true;
        }
    }

    pub fn exception_synced_at(&self, exception_id: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .maps
            .exception_synced_at
            .get(exception_id)
            .copied()
    }

    pub fn set_exception_synced_at(&self, exception_id: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        if state
            .maps
            .exception_synced_at
            .insert(exception_id.to_string(), at)
            != Some(at)
        {
            state.dirty = true;
        }
    }

    pub fn recurrence_end(&self, event_id: &str) -> Option<NaiveDate> {
        self.lock().maps.recurrence_end_dates.get(event_id).copied()
    }

    /// Cache the series end date, or clear it with `None`.
    pub fn set_recurrence_end(&self, event_id: &str, end: Option<NaiveDate>) {
        let mut state = self.lock();
        let previous = match end {
            Some(date) => state
                .maps
                .recurrence_end_dates
                .insert(event_id.to_string(), date),
            None => state.maps.recurrence_end_dates.remove(event_id),
        };
        if previous != end {
            state.dirty = true;
        }
    }

    /// Write pending changes to disk. In-memory stores just clear the dirty flag.
    pub async fn flush(&self) -> SyncResult<()> {
        let maps = {
            let mut state = self.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.maps.clone()
        };

        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let result = write_all(dir, &maps).await;
        if result.is_err() {
            self.lock().dirty = true;
        }
        result
    }
}

async fn write_all(dir: &Path, maps: &LinkMaps) -> SyncResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    write_map(&dir.join(EVENT_LINKS_FILE), &maps.event_links).await?;
    write_map(&dir.join(EVENT_SYNCED_FILE), &maps.event_synced_at).await?;
    write_map(&dir.join(EXCEPTION_SYNCED_FILE), &maps.exception_synced_at).await?;
    write_map(&dir.join(RECURRENCE_END_FILE), &maps.recurrence_end_dates).await?;
    Ok(())
}

async fn read_map<V: DeserializeOwned>(path: &Path) -> SyncResult<BTreeMap<String, V>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_map<V: Serialize>(path: &Path, map: &BTreeMap<String, V>) -> SyncResult<()> {
    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, serde_json::to_string_pretty(map)?).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}
