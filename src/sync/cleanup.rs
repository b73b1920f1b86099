//! Removal of local copies whose remote event is gone or rain-checked.
//!
//! Three independent passes, because each source of truth can be the only one left:
//! the Link Store survives cascaded attendee deletes, the pending-deletion queue
//! covers devices that were offline when the event went away, and attendee rows
//! cover links made by another install.

use std::collections::HashSet;

use super::{ItemOutcome, RunContext, SyncPhase, delete_local, item_error};
use crate::db::{attendees, deletions, events};
use crate::error::SyncResult;

const PHASE: SyncPhase = SyncPhase::CleanupDeleted;

pub(super) async fn run(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    link_store_pass(ctx).await?;
    queue_pass(ctx).await?;
    attendee_pass(ctx).await?;
    Ok(())
}

/// Ids among `event_ids` whose remote row exists and is not rain-checked.
async fn live_ids(ctx: &RunContext<'_>, event_ids: Vec<String>) -> SyncResult<HashSet<String>> {
    let found = events::get_events_by_ids(ctx.pool, &event_ids).await?;
    Ok(found
        .into_iter()
        .filter(|e| e.is_live())
        .map(|e| e.id)
        .collect())
}

async fn link_store_pass(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    let links = ctx.links.links();
    if links.is_empty() {
        return Ok(());
    }
    let live = live_ids(ctx, links.iter().map(|(id, _)| id.clone()).collect()).await?;

    for (event_id, local_id) in links {
        if live.contains(&event_id) {
            continue;
        }
        match delete_local(ctx.local, &local_id).await {
            Ok(()) => {
                ctx.links.unlink(&event_id);
                ctx.report.record(PHASE, &event_id, ItemOutcome::Done);
            }
            Err(e) => item_error(&mut ctx.report, PHASE, &event_id, e)?,
        }
    }
    Ok(())
}

async fn queue_pass(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    for row in deletions::list_pending(ctx.pool, ctx.user_id).await? {
        let deleted = delete_local(ctx.local, &row.local_event_id).await;
        // Consumed either way: a failed delete is not retried from the queue.
        deletions::mark_consumed(ctx.pool, &row.id).await?;
        ctx.links.unlink_local(&row.local_event_id);

        match deleted {
            Ok(()) => ctx.report.record(PHASE, &row.id, ItemOutcome::Done),
            Err(e) => item_error(&mut ctx.report, PHASE, &row.id, e)?,
        }
    }
    Ok(())
}

async fn attendee_pass(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    let rows: Vec<_> = attendees::list_attendees_for_user(ctx.pool, ctx.user_id)
        .await?
        .into_iter()
        .filter(|r| r.local_event_id.is_some())
        .collect();
    if rows.is_empty() {
        return Ok(());
    }
    let live = live_ids(ctx, rows.iter().map(|r| r.event_id.clone()).collect()).await?;

    for row in rows {
        let Some(local_id) = row.local_event_id.as_deref() else {
            continue;
        };
        if live.contains(&row.event_id) {
            continue;
        }
        if let Err(e) = delete_local(ctx.local, local_id).await {
            item_error(&mut ctx.report, PHASE, &row.event_id, e)?;
            continue;
        }
        ctx.links.unlink(&row.event_id);
        match attendees::delete_attendee(ctx.pool, &row.id).await {
            Err(e) if !e.is_not_found() => item_error(&mut ctx.report, PHASE, &row.id, e)?,
            _ => ctx.report.record(PHASE, &row.event_id, ItemOutcome::Done),
        }
    }
    Ok(())
}
