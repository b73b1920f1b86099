//! Creation of local copies for group events the user was invited to.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use super::{ItemOutcome, RunContext, SyncPhase, item_error};
use crate::db::models::{CalendarEvent, EventType};
use crate::db::{attendees, events};
use crate::error::SyncResult;
use crate::local::{LocalEvent, LocalEventFields};

const PHASE: SyncPhase = SyncPhase::MaterializePendingGroupEvents;

/// Items created during this run, for the first two duplicate checks.
#[derive(Default)]
struct Created {
    by_event: HashMap<String, String>,
    by_signature: HashMap<String, String>,
}

pub(super) async fn run(ctx: &mut RunContext<'_>) -> SyncResult<()> {
    let pending: Vec<String> = {
        let mut seen = HashSet::new();
        attendees::list_attendees_for_user(ctx.pool, ctx.user_id)
            .await?
            .into_iter()
            .filter(|r| r.local_event_id.is_none())
            .map(|r| r.event_id)
            .filter(|id| seen.insert(id.clone()))
            .collect()
    };
    if pending.is_empty() {
        return Ok(());
    }

    let rows: HashMap<String, CalendarEvent> = events::get_events_by_ids(ctx.pool, &pending)
        .await?
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();

    let mut created = Created::default();
    for event_id in pending {
        let Some(event) = rows.get(&event_id) else {
            ctx.report.record(PHASE, &event_id, ItemOutcome::Skipped("event missing".into()));
            continue;
        };
        if let Some(reason) = ineligible(event) {
            ctx.report.record(PHASE, &event_id, ItemOutcome::Skipped(reason.into()));
            continue;
        }

        // A link without a write-back means an earlier run stopped halfway.
        let local_id = match ctx.links.local_id(&event_id) {
            Some(local_id) => local_id,
            None => match locate_or_create(ctx, &mut created, event).await {
                Ok(local_id) => {
                    ctx.links.link(&event_id, &local_id);
                    ctx.links.set_event_synced_at(&event_id, event.updated_at);
                    ctx.links.set_recurrence_end(&event_id, event.recurrence_end_date);
                    local_id
                }
                Err(e) => {
                    item_error(&mut ctx.report, PHASE, &event_id, e)?;
                    continue;
                }
            },
        };

        match attendees::set_local_event_id(ctx.pool, &event_id, ctx.user_id, &local_id).await {
            Ok(_) => ctx.report.record(PHASE, &event_id, ItemOutcome::Done),
            Err(e) => item_error(&mut ctx.report, PHASE, &event_id, e)?,
        }
    }
    Ok(())
}

fn ineligible(event: &CalendarEvent) -> Option<&'static str> {
    if !event.is_live() {
        Some("event is rain-checked")
    } else if event.event_type != EventType::Group {
        Some("not a group event")
    } else if event.is_recurrence_exception {
        Some("recurrence exception")
    } else {
        None
    }
}

async fn locate_or_create(
    ctx: &RunContext<'_>,
    created: &mut Created,
    event: &CalendarEvent,
) -> SyncResult<String> {
    if let Some(local_id) = created.by_event.get(&event.id) {
        return Ok(local_id.clone());
    }
    let signature = event.content_signature();
    if let Some(local_id) = created.by_signature.get(&signature) {
        return Ok(local_id.clone());
    }
    if let Some(found) = ctx.local_events.iter().find(|l| same_event(l, event)) {
        tracing::debug!(event_id = %event.id, local_id = %found.id, "Adopting existing local item");
        return Ok(found.id.clone());
    }

    let local_id = ctx.local.create(&LocalEventFields::from_event(event)).await?;
    created.by_event.insert(event.id.clone(), local_id.clone());
    created.by_signature.insert(signature, local_id.clone());
    Ok(local_id)
}

/// Trimmed title, start and end within a second, same all-day flag.
fn same_event(local: &LocalEvent, event: &CalendarEvent) -> bool {
    local.fields.title.trim() == event.title.trim()
        && close(local.fields.start, event.start)
        && close(local.fields.end, event.end)
        && local.fields.all_day == event.all_day
}

fn close(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).abs() <= Duration::seconds(1)
}
