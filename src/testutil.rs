//! Shared fixtures for unit tests.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::db::models::{CalendarEvent, EventType};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// A one-hour group event on 2026-03-`day` starting at `hour` UTC.
pub fn group_event(id: &str, owner: &str, group: &str, title: &str, day: u32, hour: u32) -> CalendarEvent {
    let mut e = CalendarEvent::new(
        id,
        owner,
        group,
        EventType::Group,
        title,
        at(2026, 3, day, hour),
        at(2026, 3, day, hour + 1),
    );
    e.created_at = at(2020, 1, 1, 0);
    e.updated_at = at(2020, 1, 1, 0);
    e
}

/// A one-hour personal event on 2026-03-`day` starting at `hour` UTC.
pub fn personal_event(id: &str, owner: &str, group: &str, title: &str, day: u32, hour: u32) -> CalendarEvent {
    let mut e = group_event(id, owner, group, title, day, hour);
    e.event_type = EventType::Personal;
    e
}

/// An exception row replacing (or cancelling) one occurrence of `parent`.
pub fn exception_of(parent: &CalendarEvent, id: &str, occurrence: NaiveDate, cancelled: bool) -> CalendarEvent {
    let mut e = parent.clone();
    e.id = id.to_string();
    e.recurrence_rule = None;
    e.parent_event_id = Some(parent.id.clone());
    e.is_recurrence_exception = true;
    e.original_occurrence_date = Some(occurrence);
    e.is_public = !cancelled;
    e.original_event_id = None;
    e
}
