use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{AttendeeRecord, AttendeeStatus};
use crate::error::{SyncError, SyncResult};

/// Invite a user (or, with `user_id = None`, a named guest) to an event.
pub async fn add_attendee(
    pool: &SqlitePool,
    event_id: &str,
    user_id: Option<&str>,
    display_name: Option<&str>,
    status: AttendeeStatus,
) -> SyncResult<AttendeeRecord> {
    if user_id.is_none() && display_name.is_none() {
        return Err(SyncError::InvalidData(
            "A guest attendee needs a display name".to_string(),
        ));
    }

    let id = Uuid::now_v7().to_string();
    sqlx::query(
        "INSERT INTO event_attendees (id, event_id, user_id, display_name, status, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(event_id)
    .bind(user_id)
    .bind(display_name)
    .bind(status)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let record = sqlx::query_as::<_, AttendeeRecord>("SELECT * FROM event_attendees WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    Ok(record)
}

/// All attendee rows of a registered user.
pub async fn list_attendees_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> SyncResult<Vec<AttendeeRecord>> {
    let records = sqlx::query_as::<_, AttendeeRecord>(
        "SELECT * FROM event_attendees WHERE user_id = ? ORDER BY created_at, id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Attendee rows for a set of events.
pub async fn list_attendees_for_events(
    pool: &SqlitePool,
    event_ids: &[String],
) -> SyncResult<Vec<AttendeeRecord>> {
    if event_ids.is_empty() {
        return Ok(vec![]);
    }

    let query = format!(
        "SELECT * FROM event_attendees WHERE event_id IN ({}) ORDER BY created_at, id",
        super::placeholders(event_ids.len())
    );
    let mut q = sqlx::query_as::<_, AttendeeRecord>(&query);
    for id in event_ids {
        q = q.bind(id);
    }

    Ok(q.fetch_all(pool).await?)
}

/// Record the invitee's local copy on every still-unlinked row for `(event_id, user_id)`.
/// Returns how many rows were linked.
pub async fn set_local_event_id(
    pool: &SqlitePool,
    event_id: &str,
    user_id: &str,
    local_event_id: &str,
) -> SyncResult<u64> {
    let result = sqlx::query(
        "UPDATE event_attendees SET local_event_id = ?
         WHERE event_id = ? AND user_id = ? AND local_event_id IS NULL",
    )
    .bind(local_event_id)
    .bind(event_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Change an invitee's response.
pub async fn update_status(
    pool: &SqlitePool,
    event_id: &str,
    user_id: &str,
    status: AttendeeStatus,
) -> SyncResult<()> {
    let result = sqlx::query("UPDATE event_attendees SET status = ? WHERE event_id = ? AND user_id = ?")
        .bind(status)
        .bind(event_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::NotFound(format!(
            "User '{user_id}' is not invited to event '{event_id}'"
        )));
    }
    Ok(())
}

/// Delete an attendee row by id.
pub async fn delete_attendee(pool: &SqlitePool, id: &str) -> SyncResult<()> {
    let result = sqlx::query("DELETE FROM event_attendees WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(SyncError::NotFound("Attendee not found".to_string()));
    }
    Ok(())
}
