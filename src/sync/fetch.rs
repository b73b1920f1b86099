use std::collections::BTreeSet;

use super::RunContext;
use crate::db::{attendees, events, groups};
use crate::error::SyncResult;
use crate::merge::{self, MergeInputs, MergedEventSet, Viewer};

/// Phase 8: run the visibility queries and merge them for the viewer.
pub(super) async fn run(ctx: &RunContext<'_>) -> SyncResult<MergedEventSet> {
    let members = groups::list_members(ctx.pool, ctx.group_id).await?;
    let viewer = Viewer::new(ctx.user_id, ctx.group_id, members);

    let mut inputs = MergeInputs {
        group_events: events::list_group_events(ctx.pool, ctx.group_id, &ctx.window).await?,
        cross_group_events: events::list_cross_group_events(ctx.pool, ctx.group_id, &ctx.window)
            .await?,
        attended_events: events::list_member_attended_events(ctx.pool, ctx.group_id, &ctx.window)
            .await?,
        personal_events: events::list_member_personal_events(ctx.pool, ctx.user_id, &ctx.window)
            .await?,
        attendees: Vec::new(),
    };

    let event_ids: Vec<String> = inputs
        .group_events
        .iter()
        .chain(&inputs.cross_group_events)
        .chain(&inputs.attended_events)
        .flat_map(|e| [Some(e.id.clone()), e.parent_event_id.clone()])
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    inputs.attendees = attendees::list_attendees_for_events(ctx.pool, &event_ids).await?;

    Ok(merge::merge(&inputs, &viewer, &ctx.window))
}
