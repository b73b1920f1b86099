//! Turns the raw visibility-query rows into the display set a group member sees.
//!
//! The passes run in a fixed order and every one of them is deterministic, so the
//! same rows always merge into the same set.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::db::models::{AttendeeRecord, AttendeeStatus, CalendarEvent, EventType};
use crate::recurrence;
use crate::window::DateWindow;

/// Who is looking, and from which group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: String,
    pub group_id: String,
    pub member_ids: HashSet<String>,
}

impl Viewer {
    pub fn new(
        user_id: impl Into<String>,
        group_id: impl Into<String>,
        member_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            group_id: group_id.into(),
            member_ids: member_ids.into_iter().collect(),
        }
    }
}

/// Rows fetched for one merge.
#[derive(Debug, Clone, Default)]
pub struct MergeInputs {
    /// Events of the current group.
    pub group_events: Vec<CalendarEvent>,
    /// Group events of other groups sharing members with this one.
    pub cross_group_events: Vec<CalendarEvent>,
    /// Events any current-group member attends.
    pub attended_events: Vec<CalendarEvent>,
    /// Personal events of people the viewer shares a group with.
    pub personal_events: Vec<CalendarEvent>,
    pub attendees: Vec<AttendeeRecord>,
}

/// An event ready for display. `shared_count` is how many distinct rows it stands for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayEvent {
    #[serde(flatten)]
    pub event: CalendarEvent,
    pub shared_count: usize,
}

/// The merged, sorted output of one merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedEventSet {
    window: DateWindow,
    events: Vec<DisplayEvent>,
}

impl MergedEventSet {
    pub fn window(&self) -> &DateWindow {
        &self.window
    }

    pub fn events(&self) -> &[DisplayEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<DisplayEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events touching one calendar day in the window's zone.
    pub fn for_day(&self, date: NaiveDate) -> Vec<&DisplayEvent> {
        let day = DateWindow::new(date, date, self.window.tz);
        self.events
            .iter()
            .filter(|e| day.overlaps(e.event.start, e.event.end))
            .collect()
    }

    /// The next `limit` events that have not ended yet, without notes or location.
    pub fn widget_slice(&self, limit: usize) -> Vec<DisplayEvent> {
        self.widget_slice_at(Utc::now(), limit)
    }

    pub fn widget_slice_at(&self, now: DateTime<Utc>, limit: usize) -> Vec<DisplayEvent> {
        self.events
            .iter()
            .filter(|e| e.event.end > now || (e.event.end == e.event.start && e.event.start >= now))
            .take(limit)
            .map(|e| {
                let mut slim = e.clone();
                slim.event.location = None;
                slim.event.notes = None;
                slim
            })
            .collect()
    }
}

/// A row moving through the passes. Expanded occurrences are excluded from the
/// shared-count pass.
struct Row {
    event: CalendarEvent,
    expanded: bool,
}

/// Merge the fetched rows into the viewer's display set.
pub fn merge(inputs: &MergeInputs, viewer: &Viewer, window: &DateWindow) -> MergedEventSet {
    let related = dedup_first_by_id(
        inputs
            .cross_group_events
            .iter()
            .chain(inputs.attended_events.iter()),
    );
    let personal = dedup_personal_uploads(&inputs.personal_events);

    let unioned = union_by_id(inputs.group_events.iter().chain(related).chain(personal));
    let distinct = dedup_by_content(unioned);
    let expanded = expand_series(distinct, window);
    let visible = project_foreign(expanded, &inputs.attendees, viewer);
    let mut events = annotate_shared(visible);

    events.sort_by(|a, b| {
        a.event
            .start
            .cmp(&b.event.start)
            .then(a.event.end.cmp(&b.event.end))
    });

    tracing::debug!(
        group_id = %viewer.group_id,
        user_id = %viewer.user_id,
        count = events.len(),
        "Merged event set"
    );

    MergedEventSet {
        window: *window,
        events,
    }
}

/// Keep the first row seen for each id.
fn dedup_first_by_id<'a>(rows: impl Iterator<Item = &'a CalendarEvent>) -> Vec<&'a CalendarEvent> {
    let mut seen = HashSet::new();
    rows.filter(|e| seen.insert(e.id.as_str())).collect()
}

/// The same local event uploaded more than once collapses to the row with the
/// smallest id. Rows without a local origin pass through.
fn dedup_personal_uploads(rows: &[CalendarEvent]) -> Vec<&CalendarEvent> {
    let mut winners: HashMap<&str, &str> = HashMap::new();
    for row in rows {
        if let Some(origin) = row.original_event_id.as_deref() {
            winners
                .entry(origin)
                .and_modify(|id| {
                    if row.id.as_str() < *id {
                        *id = row.id.as_str();
                    }
                })
                .or_insert(row.id.as_str());
        }
    }

    let mut emitted = HashSet::new();
    rows.iter()
        .filter(|row| match row.original_event_id.as_deref() {
            Some(origin) => winners.get(origin) == Some(&row.id.as_str()) && emitted.insert(origin),
            None => true,
        })
        .collect()
}

/// One row per id; a group row displaces a personal row with the same id.
fn union_by_id<'a>(rows: impl Iterator<Item = &'a CalendarEvent>) -> Vec<CalendarEvent> {
    let mut out: Vec<CalendarEvent> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        match index.get(&row.id) {
            Some(&i) => {
                if out[i].event_type == EventType::Personal && row.event_type == EventType::Group {
                    out[i] = row.clone();
                }
            }
            None => {
                index.insert(row.id.clone(), out.len());
                out.push(row.clone());
            }
        }
    }
    out
}

/// Group rows claim their content signature first; any later row with a claimed
/// signature is a second copy of the same event and is dropped. Exceptions are tied
/// to their series by id and take no part. Personal rows never claim a signature:
/// identical personal rows survive here and fold together in the shared-count pass.
fn dedup_by_content(rows: Vec<CalendarEvent>) -> Vec<CalendarEvent> {
    let (exceptions, rows): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .partition(|e| e.is_recurrence_exception);
    let (group, other): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .partition(|e| e.event_type == EventType::Group);

    let mut claimed = HashSet::new();
    let mut out = Vec::with_capacity(exceptions.len() + group.len() + other.len());
    for event in group {
        let signature = event.content_signature();
        if claimed.insert(signature) {
            out.push(event);
        }
    }
    for event in other {
        if !claimed.contains(&event.content_signature()) {
            out.push(event);
        }
    }
    out.extend(exceptions);
    out
}

/// Expand series roots, keep plain rows overlapping the window and surface public
/// exceptions whose series is not in view.
fn expand_series(rows: Vec<CalendarEvent>, window: &DateWindow) -> Vec<Row> {
    let mut roots = Vec::new();
    let mut exceptions: HashMap<String, Vec<CalendarEvent>> = HashMap::new();
    let mut out = Vec::new();

    for event in rows {
        if event.is_recurrence_exception {
            match (&event.parent_event_id, event.original_occurrence_date) {
                (Some(parent), Some(_)) => exceptions.entry(parent.clone()).or_default().push(event),
                _ => tracing::warn!(event_id = %event.id, "Dropping exception without parent or date"),
            }
        } else if event.is_root() {
            roots.push(event);
        } else if window.overlaps(event.start, event.end) {
            out.push(Row {
                event,
                expanded: false,
            });
        }
    }

    for root in roots {
        let rule = match root.rule() {
            Some(Ok(rule)) => rule,
            Some(Err(e)) => {
                tracing::warn!(event_id = %root.id, error = %e, "Dropping event with malformed recurrence rule");
                exceptions.remove(&root.id);
                continue;
            }
            None => continue,
        };
        let own = exceptions.remove(&root.id).unwrap_or_default();
        out.extend(
            recurrence::expand(&root, &rule, &own, window)
                .into_iter()
                .map(|event| Row {
                    event,
                    expanded: true,
                }),
        );
    }

    // Whatever is left belongs to a series that is not part of this view.
    let mut orphans: Vec<CalendarEvent> = exceptions.into_values().flatten().collect();
    orphans.sort_by(|a, b| a.id.cmp(&b.id));
    for event in orphans {
        let in_window = event
            .original_occurrence_date
            .is_some_and(|d| window.contains_date(d));
        if event.is_public && in_window {
            out.push(Row {
                event,
                expanded: false,
            });
        }
    }

    out
}

/// Rows from another group are shown only as "busy" blocks, and only when a member of
/// the current group takes part in them.
fn project_foreign(rows: Vec<Row>, attendees: &[AttendeeRecord], viewer: &Viewer) -> Vec<Row> {
    let mut by_event: HashMap<&str, Vec<&AttendeeRecord>> = HashMap::new();
    for attendee in attendees {
        by_event
            .entry(attendee.event_id.as_str())
            .or_default()
            .push(attendee);
    }

    rows.into_iter()
        .filter_map(|mut row| {
            if row.event.group_id == viewer.group_id {
                return Some(row);
            }

            let mut names = BTreeSet::new();
            if row.event.event_type == EventType::Personal
                && viewer.member_ids.contains(&row.event.owner_user_id)
            {
                names.insert(row.event.owner_user_id.clone());
            }
            let keys = [Some(row.event.id.as_str()), row.event.parent_event_id.as_deref()];
            for key in keys.into_iter().flatten() {
                for attendee in by_event.get(key).into_iter().flatten() {
                    let is_member = attendee
                        .user_id
                        .as_ref()
                        .is_some_and(|u| viewer.member_ids.contains(u));
                    if is_member && attendee.status != AttendeeStatus::Declined {
                        names.insert(attendee.label().to_string());
                    }
                }
            }

            if names.is_empty() {
                return None;
            }
            let names: Vec<String> = names.into_iter().collect();
            row.event.title = format!("Busy ({})", names.join(", "));
            row.event.location = None;
            row.event.notes = None;
            Some(row)
        })
        .collect()
}

/// Collapse the same event held by several people into one entry carrying a count.
fn annotate_shared(rows: Vec<Row>) -> Vec<DisplayEvent> {
    let mut out = Vec::with_capacity(rows.len());
    let mut buckets: Vec<Vec<CalendarEvent>> = Vec::new();
    let mut bucket_of: HashMap<String, usize> = HashMap::new();

    for row in rows {
        if row.expanded {
            out.push(DisplayEvent {
                event: row.event,
                shared_count: 1,
            });
            continue;
        }
        let signature = row.event.content_signature();
        match bucket_of.get(&signature) {
            Some(&i) => buckets[i].push(row.event),
            None => {
                bucket_of.insert(signature, buckets.len());
                buckets.push(vec![row.event]);
            }
        }
    }

    for bucket in buckets {
        let distinct_ids = bucket.iter().map(|e| &e.id).collect::<HashSet<_>>().len();
        let distinct_owners = bucket
            .iter()
            .map(|e| &e.owner_user_id)
            .collect::<HashSet<_>>()
            .len();
        if distinct_ids >= 2 && distinct_owners >= 2 {
            let shared_count = distinct_ids;
            let carrier = bucket
                .iter()
                .position(|e| e.event_type == EventType::Group)
                .unwrap_or(0);
            let event = bucket.into_iter().nth(carrier);
            out.extend(event.map(|event| DisplayEvent {
                event,
                shared_count,
            }));
        } else {
            out.extend(bucket.into_iter().map(|event| DisplayEvent {
                event,
                shared_count: 1,
            }));
        }
    }

    out
}
