//! Rain-checking a group event: the creator can call it off directly, anyone else
//! has to ask and wait for the creator's answer.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{CalendarEvent, EventStatus, EventType};
use crate::db::{attendees, deletions, events};
use crate::error::{SyncError, SyncResult};

/// Where an event sits in the rain-check lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RainCheckState {
    Active,
    Requested { by: String },
    RainChecked,
}

pub fn state(event: &CalendarEvent) -> RainCheckState {
    if !event.is_live() {
        RainCheckState::RainChecked
    } else if let Some(by) = &event.rain_check_requested_by {
        RainCheckState::Requested { by: by.clone() }
    } else {
        RainCheckState::Active
    }
}

async fn load_group_event(pool: &SqlitePool, event_id: &str) -> SyncResult<CalendarEvent> {
    let event = events::get_event(pool, event_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("Event '{event_id}' not found")))?;
    if event.event_type != EventType::Group {
        return Err(SyncError::InvalidTransition(
            "only group events can be rain-checked".to_string(),
        ));
    }
    if !event.is_live() {
        return Err(SyncError::InvalidTransition(format!(
            "event '{event_id}' is already rain-checked"
        )));
    }
    Ok(event)
}

async fn reload(pool: &SqlitePool, event_id: &str) -> SyncResult<CalendarEvent> {
    events::get_event(pool, event_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("Event '{event_id}' not found")))
}

/// Rain-check immediately when `user_id` created the event, otherwise file a request.
pub async fn request(
    pool: &SqlitePool,
    event_id: &str,
    user_id: &str,
    reason: Option<&str>,
) -> SyncResult<CalendarEvent> {
    let event = load_group_event(pool, event_id).await?;

    if event.owner_user_id == user_id {
        return rain_check(pool, &event, Some(user_id), reason).await;
    }
    if let RainCheckState::Requested { by } = state(&event) {
        return Err(SyncError::InvalidTransition(format!(
            "a rain check for '{event_id}' was already requested by '{by}'"
        )));
    }

    events::set_rain_check_state(
        pool,
        event_id,
        Some(EventStatus::Active),
        Some(user_id),
        reason,
        None,
    )
    .await?;
    tracing::info!(event_id, requested_by = user_id, "Rain check requested");
    reload(pool, event_id).await
}

/// The creator accepts a pending request.
pub async fn approve(pool: &SqlitePool, event_id: &str, user_id: &str) -> SyncResult<CalendarEvent> {
    let event = pending_for_creator(pool, event_id, user_id).await?;
    let requested_by = event.rain_check_requested_by.clone();
    let reason = event.rain_check_reason.clone();
    rain_check(pool, &event, requested_by.as_deref(), reason.as_deref()).await
}

/// The creator turns down a pending request; the event stays on.
pub async fn deny(pool: &SqlitePool, event_id: &str, user_id: &str) -> SyncResult<CalendarEvent> {
    pending_for_creator(pool, event_id, user_id).await?;
    events::set_rain_check_state(pool, event_id, None, None, None, None).await?;
    tracing::info!(event_id, "Rain check denied");
    reload(pool, event_id).await
}

async fn pending_for_creator(
    pool: &SqlitePool,
    event_id: &str,
    user_id: &str,
) -> SyncResult<CalendarEvent> {
    let event = load_group_event(pool, event_id).await?;
    if event.owner_user_id != user_id {
        return Err(SyncError::Forbidden(format!(
            "only the creator can answer a rain check for '{event_id}'"
        )));
    }
    if !matches!(state(&event), RainCheckState::Requested { .. }) {
        return Err(SyncError::InvalidTransition(format!(
            "no rain check pending for '{event_id}'"
        )));
    }
    Ok(event)
}

/// Mark the event rain-checked and queue removal of every invitee's local copy.
async fn rain_check(
    pool: &SqlitePool,
    event: &CalendarEvent,
    requested_by: Option<&str>,
    reason: Option<&str>,
) -> SyncResult<CalendarEvent> {
    events::set_rain_check_state(
        pool,
        &event.id,
        Some(EventStatus::RainChecked),
        requested_by,
        reason,
        Some(Utc::now()),
    )
    .await?;

    let copies = attendees::list_attendees_for_events(pool, std::slice::from_ref(&event.id)).await?;
    for attendee in copies {
        if let (Some(user_id), Some(local_id)) = (&attendee.user_id, &attendee.local_event_id) {
            deletions::enqueue_deletion(pool, user_id, local_id).await?;
        }
    }

    tracing::info!(event_id = %event.id, "Event rain-checked");
    reload(pool, &event.id).await
}
