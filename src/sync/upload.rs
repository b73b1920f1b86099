//! Publishing the user's own local events as personal rows.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::RunContext;
use crate::db::models::{CalendarEvent, EventType};
use crate::db::{attendees, events};
use crate::error::SyncResult;
use crate::local::LocalEvent;

type TimeKey = (String, DateTime<Utc>, DateTime<Utc>);

pub(super) async fn run(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    let mut excluded = ctx.links.linked_local_ids();
    let mut attended_ids = Vec::new();
    for row in attendees::list_attendees_for_user(ctx.pool, ctx.user_id).await? {
        if let Some(local_id) = row.local_event_id {
            excluded.insert(local_id);
        }
        attended_ids.push(row.event_id);
    }

    // Unlinked local items that look exactly like a group event the user attends are
    // copies from somewhere else and stay private.
    let attended: HashSet<TimeKey> = events::get_events_by_ids(ctx.pool, &attended_ids)
        .await?
        .into_iter()
        .filter(|e| e.event_type == EventType::Group)
        .map(|e| (e.title, e.start, e.end))
        .collect();

    let now = Utc::now();
    let mut keys = HashSet::new();
    let mut batch = Vec::new();
    for local in &ctx.local_events {
        if excluded.contains(&local.id) {
            continue;
        }
        let key = (local.fields.title.clone(), local.fields.start, local.fields.end);
        if attended.contains(&key) {
            continue;
        }
        // The upsert rejects a batch naming the same key twice.
        if !keys.insert(local.id.as_str()) {
            continue;
        }
        batch.push(personal_row(ctx, local, now)?);
    }

    if batch.is_empty() {
        return Ok(());
    }
    ctx.report.uploaded = events::upsert_personal_events(ctx.pool, &batch).await?;
    Ok(())
}

fn personal_row(ctx: &RunContext<'_>, local: &LocalEvent, now: DateTime<Utc>) -> SyncResult<CalendarEvent> {
    let fields = &local.fields;
    let mut row = CalendarEvent::new(
        Uuid::now_v7().to_string(),
        ctx.user_id,
        ctx.group_id,
        EventType::Personal,
        fields.title.clone(),
        fields.start,
        fields.end,
    );
    if let Some(rule) = &fields.recurrence_rule {
        row = row.with_rule(rule)?;
        row.recurrence_end_date = fields.recurrence_end.map(|d| d - Duration::days(1));
    }
    row.all_day = fields.all_day;
    row.location = fields.location.clone();
    row.notes = fields.notes.clone();
    row.original_event_id = Some(local.id.clone());
    row.created_at = now;
    row.updated_at = now;
    row.synced_at = Some(now);
    Ok(row)
}
