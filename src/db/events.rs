use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::query::{Query, QueryAs};
use sqlx::sqlite::{Sqlite, SqliteArguments};

use super::models::{CalendarEvent, EventStatus};
use crate::error::{SyncError, SyncResult};
use crate::window::DateWindow;

const INSERT_EVENT: &str = "INSERT INTO calendar_events
    (id, owner_user_id, group_id, title, start_time, end_time, all_day, location, notes,
     category_id, event_type, is_public, original_event_id, created_at, updated_at, synced_at,
     recurrence_rule, recurrence_end_date, parent_event_id, is_recurrence_exception,
     original_occurrence_date, event_status, rain_check_requested_by, rain_check_reason,
     rain_checked_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Rows that are not rain-checked.
const LIVE: &str = "(event_status IS NULL OR event_status = 'active')";

/// Rows that can contribute to a window: overlapping plain rows, series roots that
/// started before the window closes, and every exception (filtered later by date).
/// Binds: window end, window start, window end.
const IN_WINDOW: &str = "((start_time < ? AND end_time > ?)
     OR (recurrence_rule IS NOT NULL AND parent_event_id IS NULL AND start_time < ?)
     OR is_recurrence_exception = 1)";

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind every column of an event, in `INSERT_EVENT` order.
fn bind_event<'q>(query: SqliteQuery<'q>, event: &'q CalendarEvent) -> SqliteQuery<'q> {
    query
        .bind(&event.id)
        .bind(&event.owner_user_id)
        .bind(&event.group_id)
        .bind(&event.title)
        .bind(event.start)
        .bind(event.end)
        .bind(event.all_day)
        .bind(&event.location)
        .bind(&event.notes)
        .bind(&event.category_id)
        .bind(event.event_type)
        .bind(event.is_public)
        .bind(&event.original_event_id)
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.synced_at)
        .bind(&event.recurrence_rule)
        .bind(event.recurrence_end_date)
        .bind(&event.parent_event_id)
        .bind(event.is_recurrence_exception)
        .bind(event.original_occurrence_date)
        .bind(event.event_status)
        .bind(&event.rain_check_requested_by)
        .bind(&event.rain_check_reason)
        .bind(event.rain_checked_at)
}

type SqliteQueryAs<'q, O> = QueryAs<'q, Sqlite, O, SqliteArguments<'q>>;

fn bind_window<'q, O>(query: SqliteQueryAs<'q, O>, window: &DateWindow) -> SqliteQueryAs<'q, O> {
    let (start, end) = (window.start_utc(), window.end_utc());
    query.bind(end).bind(start).bind(end)
}

/// Insert a new event row exactly as given.
pub async fn create_event(pool: &SqlitePool, event: &CalendarEvent) -> SyncResult<CalendarEvent> {
    bind_event(sqlx::query(INSERT_EVENT), event)
        .execute(pool)
        .await?;

    get_event(pool, &event.id)
        .await?
        .ok_or_else(|| SyncError::Internal(anyhow::anyhow!("Event inserted but not found")))
}

/// Get an event by id.
pub async fn get_event(pool: &SqlitePool, id: &str) -> SyncResult<Option<CalendarEvent>> {
    let event = sqlx::query_as::<_, CalendarEvent>("SELECT * FROM calendar_events WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(event)
}

/// Get several events by id. Missing ids are simply absent from the result.
pub async fn get_events_by_ids(pool: &SqlitePool, ids: &[String]) -> SyncResult<Vec<CalendarEvent>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let query = format!(
        "SELECT * FROM calendar_events WHERE id IN ({}) ORDER BY start_time, id",
        super::placeholders(ids.len())
    );
    let mut q = sqlx::query_as::<_, CalendarEvent>(&query);
    for id in ids {
        q = q.bind(id);
    }

    Ok(q.fetch_all(pool).await?)
}

/// Overwrite an event's editable fields and bump `updated_at`.
pub async fn update_event(pool: &SqlitePool, event: &CalendarEvent) -> SyncResult<CalendarEvent> {
    let result = sqlx::query(
        "UPDATE calendar_events SET title = ?, start_time = ?, end_time = ?, all_day = ?,
         location = ?, notes = ?, category_id = ?, is_public = ?, recurrence_rule = ?,
         recurrence_end_date = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&event.title)
    .bind(event.start)
    .bind(event.end)
    .bind(event.all_day)
    .bind(&event.location)
    .bind(&event.notes)
    .bind(&event.category_id)
    .bind(event.is_public)
    .bind(&event.recurrence_rule)
    .bind(event.recurrence_end_date)
    .bind(Utc::now())
    .bind(&event.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::NotFound(format!("Event '{}' not found", event.id)));
    }

    get_event(pool, &event.id)
        .await?
        .ok_or_else(|| SyncError::Internal(anyhow::anyhow!("Event updated but not found")))
}

/// Delete an event. Attendee rows and exceptions go with it (cascade).
pub async fn delete_event(pool: &SqlitePool, id: &str) -> SyncResult<()> {
    let result = sqlx::query("DELETE FROM calendar_events WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::NotFound(format!("Event '{id}' not found")));
    }
    Ok(())
}

/// Write the rain-check columns of an event in one statement.
pub async fn set_rain_check_state(
    pool: &SqlitePool,
    id: &str,
    status: Option<EventStatus>,
    requested_by: Option<&str>,
    reason: Option<&str>,
    rain_checked_at: Option<DateTime<Utc>>,
) -> SyncResult<()> {
    let result = sqlx::query(
        "UPDATE calendar_events SET event_status = ?, rain_check_requested_by = ?,
         rain_check_reason = ?, rain_checked_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(status)
    .bind(requested_by)
    .bind(reason)
    .bind(rain_checked_at)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::NotFound(format!("Event '{id}' not found")));
    }
    Ok(())
}

/// Live events of the current group that can appear in the window.
pub async fn list_group_events(
    pool: &SqlitePool,
    group_id: &str,
    window: &DateWindow,
) -> SyncResult<Vec<CalendarEvent>> {
    let query = format!(
        "SELECT * FROM calendar_events
         WHERE group_id = ? AND {LIVE} AND {IN_WINDOW}
         ORDER BY start_time, id"
    );
    let q = sqlx::query_as::<_, CalendarEvent>(&query).bind(group_id);
    Ok(bind_window(q, window).fetch_all(pool).await?)
}

/// Live group events of other groups that share at least one member with `group_id`.
pub async fn list_cross_group_events(
    pool: &SqlitePool,
    group_id: &str,
    window: &DateWindow,
) -> SyncResult<Vec<CalendarEvent>> {
    let query = format!(
        "SELECT * FROM calendar_events
         WHERE event_type = 'group'
           AND group_id != ?
           AND group_id IN (
               SELECT gm.group_id FROM group_members gm
               WHERE gm.user_id IN (SELECT user_id FROM group_members WHERE group_id = ?)
           )
           AND {LIVE} AND {IN_WINDOW}
         ORDER BY start_time, id"
    );
    let q = sqlx::query_as::<_, CalendarEvent>(&query)
        .bind(group_id)
        .bind(group_id);
    Ok(bind_window(q, window).fetch_all(pool).await?)
}

/// Live events any member of `group_id` attends, regardless of group membership rows.
pub async fn list_member_attended_events(
    pool: &SqlitePool,
    group_id: &str,
    window: &DateWindow,
) -> SyncResult<Vec<CalendarEvent>> {
    let query = format!(
        "SELECT * FROM calendar_events
         WHERE id IN (
               SELECT ea.event_id FROM event_attendees ea
               WHERE ea.user_id IN (SELECT user_id FROM group_members WHERE group_id = ?)
           )
           AND {LIVE} AND {IN_WINDOW}
         ORDER BY start_time, id"
    );
    let q = sqlx::query_as::<_, CalendarEvent>(&query).bind(group_id);
    Ok(bind_window(q, window).fetch_all(pool).await?)
}

/// Live personal events owned by anyone who shares a group with `viewer_id`.
pub async fn list_member_personal_events(
    pool: &SqlitePool,
    viewer_id: &str,
    window: &DateWindow,
) -> SyncResult<Vec<CalendarEvent>> {
    let query = format!(
        "SELECT * FROM calendar_events
         WHERE event_type = 'personal'
           AND owner_user_id IN (
               SELECT gm.user_id FROM group_members gm
               WHERE gm.group_id IN (SELECT group_id FROM group_members WHERE user_id = ?)
           )
           AND {LIVE} AND {IN_WINDOW}
         ORDER BY start_time, id"
    );
    let q = sqlx::query_as::<_, CalendarEvent>(&query).bind(viewer_id);
    Ok(bind_window(q, window).fetch_all(pool).await?)
}

/// Every recurrence exception in a group the user belongs to.
pub async fn list_exceptions_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> SyncResult<Vec<CalendarEvent>> {
    let events = sqlx::query_as::<_, CalendarEvent>(
        "SELECT * FROM calendar_events
         WHERE is_recurrence_exception = 1
           AND group_id IN (SELECT group_id FROM group_members WHERE user_id = ?)
         ORDER BY updated_at, id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(events)
}

/// Upsert uploaded personal events keyed by `(owner_user_id, group_id, original_event_id)`.
///
/// Like the hosted store this mirrors, a batch that names the same key twice is
/// rejected as a whole. Rows whose fields are unchanged are left untouched, so
/// `updated_at` only moves on a real edit. Returns the number of rows written.
pub async fn upsert_personal_events(
    pool: &SqlitePool,
    events: &[CalendarEvent],
) -> SyncResult<u64> {
    let mut keys = HashSet::new();
    for event in events {
        if let Some(original) = event.original_event_id.as_deref() {
            let key = (event.owner_user_id.as_str(), event.group_id.as_str(), original);
            if !keys.insert(key) {
                return Err(SyncError::Conflict(format!(
                    "Batch contains duplicate upsert key for local event '{original}'"
                )));
            }
        }
    }

    let upsert = format!(
        "{INSERT_EVENT}
         ON CONFLICT(owner_user_id, group_id, original_event_id) DO UPDATE SET
             title = excluded.title,
             start_time = excluded.start_time,
             end_time = excluded.end_time,
             all_day = excluded.all_day,
             location = excluded.location,
             notes = excluded.notes,
             recurrence_rule = excluded.recurrence_rule,
             recurrence_end_date = excluded.recurrence_end_date,
             updated_at = excluded.updated_at,
             synced_at = excluded.synced_at
         WHERE title IS NOT excluded.title
            OR start_time IS NOT excluded.start_time
            OR end_time IS NOT excluded.end_time
            OR all_day IS NOT excluded.all_day
            OR location IS NOT excluded.location
            OR notes IS NOT excluded.notes
            OR recurrence_rule IS NOT excluded.recurrence_rule
            OR recurrence_end_date IS NOT excluded.recurrence_end_date"
    );

    let mut tx = pool.begin().await?;
    let mut written = 0;
    for event in events {
        let result = bind_event(sqlx::query(&upsert), event)
            .execute(&mut *tx)
            .await?;
        written += result.rows_affected();
    }
    tx.commit().await?;

    Ok(written)
}
