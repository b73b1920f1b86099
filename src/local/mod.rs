//! The device calendar, seen through the operations the sync engine needs.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{CalendarEvent, RecurrenceRule};
use crate::error::SyncResult;
use crate::window::DateWindow;

pub use memory::MemoryLocalStore;

/// Writable fields of a local calendar item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEventFields {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub recurrence_rule: Option<RecurrenceRule>,
    /// Exclusive: the series has no occurrences on or after this date.
    pub recurrence_end: Option<NaiveDate>,
}

impl LocalEventFields {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            start,
            end,
            all_day: false,
            location: None,
            notes: None,
            recurrence_rule: None,
            recurrence_end: None,
        }
    }

    /// Fields for a local copy of a remote event. A malformed remote rule yields a
    /// one-off copy rather than no copy at all.
    pub fn from_event(event: &CalendarEvent) -> Self {
        let recurrence_rule = event.rule().and_then(Result::ok);
        Self {
            title: event.title.clone(),
            start: event.start,
            end: event.end,
            all_day: event.all_day,
            location: event.location.clone(),
            notes: event.notes.clone(),
            recurrence_end: recurrence_rule
                .as_ref()
                .and(event.recurrence_end_date)
                .map(|d| d + chrono::Duration::days(1)),
            recurrence_rule,
        }
    }
}

/// An item read back from the device calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEvent {
    pub id: String,
    #[serde(flatten)]
    pub fields: LocalEventFields,
}


/// Operations on the device calendar. Identifiers are opaque strings chosen by the store.
///
/// Deleting or editing something that no longer exists returns
/// [`SyncError::NotFound`](crate::error::SyncError::NotFound); callers doing cleanup treat
/// that as success.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Items overlapping the window. Recurring series are returned once, as their master.
    async fn query(&self, window: &DateWindow) -> SyncResult<Vec<LocalEvent>>;

    /// Create an item and return its identifier.
    async fn create(&self, fields: &LocalEventFields) -> SyncResult<String>;

    async fn update(&self, local_id: &str, fields: &LocalEventFields) -> SyncResult<()>;

    async fn delete(&self, local_id: &str) -> SyncResult<()>;

    /// Remove one occurrence of a series.
    async fn delete_occurrence(&self, local_id: &str, occurrence: NaiveDate) -> SyncResult<()>;

    /// Stop a series before `date` (exclusive).
    async fn end_recurrence_at(&self, local_id: &str, date: NaiveDate) -> SyncResult<()>;

    /// Replace one occurrence of a series with different fields.
    async fn update_occurrence(
        &self,
        local_id: &str,
        occurrence: NaiveDate,
        fields: &LocalEventFields,
    ) -> SyncResult<()>;
}
