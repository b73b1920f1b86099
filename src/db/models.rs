use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Whether an event lives only in its owner's calendar or is shared with a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum EventType {
    Personal,
    Group,
}

/// Lifecycle status of a remote event. `NULL` in the store means active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum EventStatus {
    Active,
    RainChecked,
}

/// An invitee's response to a group event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum AttendeeStatus {
    Invited,
    Going,
    Maybe,
    Declined,
}

/// A row of `calendar_events`, the canonical remote event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CalendarEvent {
    pub id: String,
    pub owner_user_id: String,
    pub group_id: String,
    pub title: String,
    #[sqlx(rename = "start_time")]
    pub start: DateTime<Utc>,
    #[sqlx(rename = "end_time")]
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub category_id: Option<String>,
    pub event_type: EventType,
    pub is_public: bool,
    pub original_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    /// JSON-encoded [`RecurrenceRule`]; parsed lazily so one bad row cannot fail a whole query.
    pub recurrence_rule: Option<String>,
    pub recurrence_end_date: Option<NaiveDate>,
    pub parent_event_id: Option<String>,
    pub is_recurrence_exception: bool,
    pub original_occurrence_date: Option<NaiveDate>,
    pub event_status: Option<EventStatus>,
    pub rain_check_requested_by: Option<String>,
    pub rain_check_reason: Option<String>,
    pub rain_checked_at: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    /// A new active, public, non-recurring event stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        owner_user_id: impl Into<String>,
        group_id: impl Into<String>,
        event_type: EventType,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_user_id: owner_user_id.into(),
            group_id: group_id.into(),
            title: title.into(),
            start,
            end,
            all_day: false,
            location: None,
            notes: None,
            category_id: None,
            event_type,
            is_public: true,
            original_event_id: None,
            created_at: now,
            updated_at: now,
            synced_at: None,
            recurrence_rule: None,
            recurrence_end_date: None,
            parent_event_id: None,
            is_recurrence_exception: false,
            original_occurrence_date: None,
            event_status: None,
            rain_check_requested_by: None,
            rain_check_reason: None,
            rain_checked_at: None,
        }
    }

    /// Attach a recurrence rule, serialized the way the store keeps it.
    pub fn with_rule(mut self, rule: &RecurrenceRule) -> SyncResult<Self> {
        self.recurrence_rule = Some(serde_json::to_string(rule)?);
        Ok(self)
    }

    /// Parse the stored recurrence rule, if any. Malformed or invalid rules are errors.
    pub fn rule(&self) -> Option<SyncResult<RecurrenceRule>> {
        self.recurrence_rule.as_deref().map(|raw| {
            let rule: RecurrenceRule = serde_json::from_str(raw)?;
            rule.validate()?;
            Ok(rule)
        })
    }

    /// Active means not rain-checked.
    pub fn is_live(&self) -> bool {
        !matches!(self.event_status, Some(EventStatus::RainChecked))
    }

    /// A series root: has a rule and no parent.
    pub fn is_root(&self) -> bool {
        self.recurrence_rule.is_some()
            && self.parent_event_id.is_none()
            && !self.is_recurrence_exception
    }

    /// `title|start_epoch|end_epoch|all_day`, used to spot the same event arriving by two paths.
    pub fn content_signature(&self) -> String {
        content_signature(&self.title, self.start, self.end, self.all_day)
    }
}

/// Build a content signature from its parts.
pub fn content_signature(
    title: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    all_day: bool,
) -> String {
    format!(
        "{}|{}|{}|{}",
        title,
        start.timestamp(),
        end.timestamp(),
        all_day
    )
}

/// How often a series repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// When a series stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecurrenceEnd {
    #[default]
    Never,
    Count { count: u32 },
    EndDate { date: NaiveDate },
}

/// A recurrence rule owned by a single root event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// 0 = Sunday .. 6 = Saturday. Weekly rules only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_of_year: Option<u32>,
    #[serde(default)]
    pub end: RecurrenceEnd,
}

fn default_interval() -> u32 {
    1
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            days_of_week: None,
            day_of_month: None,
            month_of_year: None,
            end: RecurrenceEnd::Never,
        }
    }

    /// Reject rules the expander cannot honour.
    pub fn validate(&self) -> SyncResult<()> {
        if self.interval == 0 {
            return Err(SyncError::InvalidData("interval must be at least 1".into()));
        }
        if let Some(days) = &self.days_of_week {
            if days.iter().any(|d| *d > 6) {
                return Err(SyncError::InvalidData(format!(
                    "days_of_week out of range: {days:?}"
                )));
            }
        }
        if let Some(day) = self.day_of_month {
            if !(1..=31).contains(&day) {
                return Err(SyncError::InvalidData(format!(
                    "day_of_month out of range: {day}"
                )));
            }
        }
        if let Some(month) = self.month_of_year {
            if !(1..=12).contains(&month) {
                return Err(SyncError::InvalidData(format!(
                    "month_of_year out of range: {month}"
                )));
            }
        }
        if let RecurrenceEnd::Count { count: 0 } = self.end {
            return Err(SyncError::InvalidData("count must be at least 1".into()));
        }
        Ok(())
    }
}

/// A row of `event_attendees`. `user_id` is `None` for unregistered guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttendeeRecord {
    pub id: String,
    pub event_id: String,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub status: AttendeeStatus,
    /// The invitee's own local-store copy of the event.
    pub local_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AttendeeRecord {
    /// Name shown in "busy" placeholders.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("guest")
    }
}

/// A queued request to remove a local copy from one user's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingDeletion {
    pub id: String,
    pub user_id: String,
    pub local_event_id: String,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}
