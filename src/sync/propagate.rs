//! Pushing remote edits into existing local copies.

use std::collections::{HashMap, HashSet};

use chrono::Duration;

use super::{ItemOutcome, RunContext, SyncPhase, item_error};
use crate::db::models::CalendarEvent;
use crate::db::{attendees, events};
use crate::error::SyncResult;
use crate::local::LocalEventFields;

/// Remote event id → local id, from the user's attendee write-backs.
async fn attendee_links(ctx: &RunContext<'_>) -> SyncResult<HashMap<String, String>> {
    let mut links = HashMap::new();
    for row in attendees::list_attendees_for_user(ctx.pool, ctx.user_id).await? {
        if let Some(local_id) = row.local_event_id {
            links.entry(row.event_id).or_insert(local_id);
        }
    }
    Ok(links)
}

/// Phase 4: copy title, times, place and notes of edited group events.
pub(super) async fn modified_events(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    const PHASE: SyncPhase = SyncPhase::PropagateModifiedGroupEvents;

    let linked = attendee_links(ctx).await?;
    if linked.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = linked.keys().cloned().collect();
    let mut rows = events::get_events_by_ids(ctx.pool, &ids).await?;
    rows.retain(CalendarEvent::is_live);

    for event in rows {
        let cached = ctx.links.event_synced_at(&event.id);
        if cached.is_some_and(|at| event.updated_at <= at) {
            continue;
        }
        let Some(local_id) = ctx
            .links
            .local_id(&event.id)
            .or_else(|| linked.get(&event.id).cloned())
        else {
            continue;
        };

        let cached_end = ctx.links.recurrence_end(&event.id);
        let result = match event.recurrence_end_date {
            Some(end) if cached.is_some() && cached_end != Some(end) => {
                tracing::debug!(event_id = %event.id, %end, "Ending local series");
                ctx.local
                    .end_recurrence_at(&local_id, end + Duration::days(1))
                    .await
            }
            _ => {
                ctx.local
                    .update(&local_id, &LocalEventFields::from_event(&event))
                    .await
            }
        };

        match result {
            Ok(()) => {
                ctx.links.link(&event.id, &local_id);
                ctx.links.set_event_synced_at(&event.id, event.updated_at);
                ctx.links.set_recurrence_end(&event.id, event.recurrence_end_date);
                ctx.report.record(PHASE, &event.id, ItemOutcome::Done);
            }
            Err(e) => item_error(&mut ctx.report, PHASE, &event.id, e)?,
        }
    }
    Ok(())
}

/// Phase 5: apply cancelled and modified occurrences to local series.
pub(super) async fn exceptions(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    const PHASE: SyncPhase = SyncPhase::PropagateRecurrenceExceptions;

    let rows = events::list_exceptions_for_user(ctx.pool, ctx.user_id).await?;
    if rows.is_empty() {
        return Ok(());
    }
    let linked = attendee_links(ctx).await?;
    let mut unlinked_series = HashSet::new();

    for exception in rows {
        let (Some(parent_id), Some(occurrence)) = (
            exception.parent_event_id.as_deref(),
            exception.original_occurrence_date,
        ) else {
            continue;
        };
        if ctx
            .links
            .exception_synced_at(&exception.id)
            .is_some_and(|at| exception.updated_at <= at)
        {
            continue;
        }
        let Some(local_id) = ctx
            .links
            .local_id(parent_id)
            .or_else(|| linked.get(parent_id).cloned())
        else {
            if unlinked_series.insert(parent_id.to_string()) {
                ctx.report.record(
                    PHASE,
                    &exception.id,
                    ItemOutcome::Skipped("series has no local copy".into()),
                );
            }
            continue;
        };

        let result = if exception.is_public {
            ctx.local
                .update_occurrence(&local_id, occurrence, &LocalEventFields::from_event(&exception))
                .await
        } else {
            ctx.local.delete_occurrence(&local_id, occurrence).await
        };

        match result {
            Ok(()) => {
                ctx.links
                    .set_exception_synced_at(&exception.id, exception.updated_at);
                ctx.report.record(PHASE, &exception.id, ItemOutcome::Done);
            }
            Err(e) => item_error(&mut ctx.report, PHASE, &exception.id, e)?,
        }
    }
    Ok(())
}
