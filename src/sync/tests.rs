use std::sync::Arc;

use chrono::NaiveDate;
use sqlx::SqlitePool;

use super::*;
use crate::db::models::{AttendeeStatus, CalendarEvent, EventStatus, Frequency, RecurrenceRule};
use crate::db::{self, attendees, deletions, events, groups};
use crate::local::{LocalEventFields, MemoryLocalStore};
use crate::rain_check;
use crate::testutil::{at, date, exception_of, group_event};

const GROUP: &str = "g1";
const USER: &str = "bob";

struct Harness {
    pool: SqlitePool,
    local: Arc<MemoryLocalStore>,
    links: Arc<LinkStore>,
    engine: SyncEngine,
}

fn today() -> NaiveDate {
    date(2026, 3, 1)
}

async fn harness() -> Harness {
    let pool = db::test_pool().await;
    for user in ["alice", "bob"] {
        groups::add_member(&pool, GROUP, user).await.unwrap();
    }
    let local = Arc::new(MemoryLocalStore::new());
    let links = Arc::new(LinkStore::in_memory());
    let engine = SyncEngine::new(pool.clone(), local.clone(), links.clone());
    Harness {
        pool,
        local,
        links,
        engine,
    }
}

impl Harness {
    async fn run(&self) -> SyncOutput {
        self.engine
            .sync_at(GROUP, USER, today(), SyncTrigger::Manual)
            .await
            .unwrap()
    }

    /// Store a group event and invite `invitees` to it.
    async fn invite(&self, event: CalendarEvent, invitees: &[&str]) {
        events::create_event(&self.pool, &event).await.unwrap();
        for user in invitees {
            attendees::add_attendee(&self.pool, &event.id, Some(user), None, AttendeeStatus::Going)
                .await
                .unwrap();
        }
    }

    async fn local_id_on_attendee_row(&self, event_id: &str) -> Option<String> {
        attendees::list_attendees_for_user(&self.pool, USER)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.event_id == event_id)
            .and_then(|r| r.local_event_id)
    }

    async fn personal_rows(&self) -> Vec<CalendarEvent> {
        let window = DateWindow::starting(today(), DEFAULT_WINDOW_DAYS, Tz::UTC);
        events::list_member_personal_events(&self.pool, USER, &window)
            .await
            .unwrap()
    }
}

fn weekly_series(id: &str, day: u32) -> CalendarEvent {
    group_event(id, "alice", GROUP, "Run club", day, 7)
        .with_rule(&RecurrenceRule::new(Frequency::Weekly))
        .unwrap()
}

#[tokio::test]
async fn test_materializes_invited_group_event() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;

    let output = h.run().await;

    assert_eq!(output.report.done(SyncPhase::MaterializePendingGroupEvents), 1);
    assert_eq!(h.local.len(), 1);
    let local_id = h.links.local_id("e1").unwrap();
    assert_eq!(h.local.get(&local_id).unwrap().fields.title, "Dinner");
    assert_eq!(h.local_id_on_attendee_row("e1").await, Some(local_id));
    assert_eq!(h.links.event_synced_at("e1"), Some(at(2020, 1, 1, 0)));

    // The copy is not uploaded back as a personal event.
    assert_eq!(output.report.uploaded, 0);
    assert!(h.personal_rows().await.is_empty());

    let ids: Vec<_> = output.merged.events().iter().map(|e| e.event.id.as_str()).collect();
    assert_eq!(ids, vec!["e1"]);
}

#[tokio::test]
async fn test_adopts_matching_local_item() {
    let h = harness().await;
    let event = group_event("e1", "alice", GROUP, "Dinner", 5, 19);
    let mut fields = LocalEventFields::from_event(&event);
    fields.title = "Dinner ".into();
    let existing = h.local.create(&fields).await.unwrap();
    h.invite(event, &["bob"]).await;

    h.run().await;

    assert_eq!(h.local.len(), 1);
    assert_eq!(h.links.local_id("e1"), Some(existing));
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let h = harness().await;
    h.local
        .create(&LocalEventFields::new("Gym", at(2026, 3, 3, 6), at(2026, 3, 3, 7)))
        .await
        .unwrap();
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    let series = weekly_series("s1", 2);
    h.invite(series.clone(), &["bob", "alice"]).await;
    events::create_event(&h.pool, &exception_of(&series, "s1-x", date(2026, 3, 9), true))
        .await
        .unwrap();

    let first = h.run().await;
    assert_eq!(first.report.uploaded, 1);
    assert_eq!(first.report.failures().count(), 0);
    let links_after_first = h.links.snapshot();
    let mutations_after_first = h.local.mutation_count();

    let second = h.run().await;

    assert_eq!(second.merged, first.merged);
    assert_eq!(h.links.snapshot(), links_after_first);
    assert_eq!(h.local.mutation_count(), mutations_after_first);
    assert_eq!(second.report.uploaded, 0);

    let titles: Vec<_> = second
        .merged
        .events()
        .iter()
        .map(|e| e.event.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Run club", "Gym", "Dinner"]);
}

#[tokio::test]
async fn test_cleanup_after_remote_delete_is_idempotent() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    h.run().await;
    assert_eq!(h.local.len(), 1);

    // Cascades into the attendee rows; only the Link Store still knows the copy.
    events::delete_event(&h.pool, "e1").await.unwrap();
    let output = h.run().await;

    assert!(h.local.is_empty());
    assert!(h.links.local_id("e1").is_none());
    assert_eq!(output.report.done(SyncPhase::CleanupDeleted), 1);

    let mutations = h.local.mutation_count();
    let output = h.run().await;
    assert_eq!(h.local.mutation_count(), mutations);
    assert_eq!(output.report.done(SyncPhase::CleanupDeleted), 0);
}

#[tokio::test]
async fn test_rain_checked_event_is_cleaned_up() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    h.run().await;

    rain_check::request(&h.pool, "e1", "alice", Some("flu")).await.unwrap();
    let output = h.run().await;

    assert!(h.local.is_empty());
    assert!(h.links.snapshot().event_links.is_empty());
    assert!(h.local_id_on_attendee_row("e1").await.is_none());
    assert!(attendees::list_attendees_for_user(&h.pool, USER)
        .await
        .unwrap()
        .is_empty());
    assert!(output.merged.is_empty());

    let mutations = h.local.mutation_count();
    h.run().await;
    assert_eq!(h.local.mutation_count(), mutations);
}

#[tokio::test]
async fn test_queued_deletion_removes_unlinked_copy() {
    let h = harness().await;
    let local_id = h
        .local
        .create(&LocalEventFields::new("Old plans", at(2026, 3, 4, 18), at(2026, 3, 4, 19)))
        .await
        .unwrap();
    deletions::enqueue_deletion(&h.pool, USER, &local_id).await.unwrap();
    assert!(h.links.snapshot().event_links.is_empty());

    let output = h.run().await;

    assert!(h.local.get(&local_id).is_none());
    assert_eq!(output.report.done(SyncPhase::CleanupDeleted), 1);
    assert!(deletions::list_pending(&h.pool, USER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queued_deletion_is_consumed_when_delete_fails() {
    let h = harness().await;
    let local_id = h
        .local
        .create(&LocalEventFields::new("Stuck", at(2026, 3, 4, 18), at(2026, 3, 4, 19)))
        .await
        .unwrap();
    deletions::enqueue_deletion(&h.pool, USER, &local_id).await.unwrap();
    h.local.fail_writes_for("Stuck");

    let output = h.run().await;

    assert_eq!(output.report.failed(SyncPhase::CleanupDeleted), 1);
    assert!(h.local.get(&local_id).is_some());
    assert!(deletions::list_pending(&h.pool, USER).await.unwrap().is_empty());

    let mutations = h.local.mutation_count();
    let output = h.run().await;
    assert_eq!(output.report.in_phase(SyncPhase::CleanupDeleted).count(), 0);
    assert_eq!(h.local.mutation_count(), mutations);
}

#[tokio::test]
async fn test_orphaned_attendee_copy_is_removed() {
    let h = harness().await;
    let event = group_event("e1", "alice", GROUP, "Dinner", 5, 19);
    let local_id = h
        .local
        .create(&LocalEventFields::from_event(&event))
        .await
        .unwrap();
    h.invite(event, &["bob"]).await;
    attendees::set_local_event_id(&h.pool, "e1", USER, &local_id)
        .await
        .unwrap();
    events::set_rain_check_state(
        &h.pool,
        "e1",
        Some(EventStatus::RainChecked),
        Some("alice"),
        None,
        Some(at(2026, 3, 1, 8)),
    )
    .await
    .unwrap();

    let output = h.run().await;

    assert!(h.local.get(&local_id).is_none());
    assert_eq!(output.report.done(SyncPhase::CleanupDeleted), 1);
    assert!(attendees::list_attendees_for_user(&h.pool, USER)
        .await
        .unwrap()
        .is_empty());
    assert!(h.links.local_id("e1").is_none());
}

#[tokio::test]
async fn test_upload_excludes_group_copies() {
    let h = harness().await;
    let gym = h
        .local
        .create(&LocalEventFields::new("Gym", at(2026, 3, 3, 6), at(2026, 3, 3, 7)))
        .await
        .unwrap();
    let movie = group_event("e2", "alice", GROUP, "Movie", 6, 20);
    // Same title and times as an attended event, but an all-day flag keeps it from
    // being adopted as the linked copy.
    let mut lookalike = LocalEventFields::from_event(&movie);
    lookalike.all_day = true;
    h.local.create(&lookalike).await.unwrap();
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    h.invite(movie, &["bob"]).await;

    let output = h.run().await;

    assert_eq!(h.local.len(), 4);
    assert_eq!(output.report.uploaded, 1);
    let uploaded = h.personal_rows().await;
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].title, "Gym");
    assert_eq!(uploaded[0].owner_user_id, USER);
    assert_eq!(uploaded[0].original_event_id.as_deref(), Some(gym.as_str()));
}

#[tokio::test]
async fn test_item_failure_is_recorded_and_retried() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    h.invite(group_event("e2", "alice", GROUP, "Broken", 6, 19), &["bob"])
        .await;
    h.local.fail_writes_for("Broken");

    let output = h.run().await;
    assert_eq!(output.report.done(SyncPhase::MaterializePendingGroupEvents), 1);
    assert_eq!(output.report.failed(SyncPhase::MaterializePendingGroupEvents), 1);
    let failure = output.report.failures().next().unwrap();
    assert_eq!(failure.item_id, "e2");
    assert!(h.links.local_id("e2").is_none());
    assert!(h.local_id_on_attendee_row("e2").await.is_none());
    assert!(h.engine.status().last_error.is_none());

    h.local.clear_write_failures();
    let output = h.run().await;
    assert_eq!(output.report.done(SyncPhase::MaterializePendingGroupEvents), 1);
    assert!(h.links.local_id("e2").is_some());
    assert_eq!(h.local.len(), 2);
}

#[tokio::test]
async fn test_rejected_write_back_fails_only_its_item() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    h.invite(group_event("e2", "alice", GROUP, "Movie", 6, 20), &["bob"])
        .await;
    sqlx::query(
        "CREATE TRIGGER reject_write_back BEFORE UPDATE OF local_event_id ON event_attendees
         WHEN NEW.event_id = 'e2'
         BEGIN SELECT RAISE(ABORT, 'row rejected'); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let output = h.run().await;
    assert_eq!(output.report.done(SyncPhase::MaterializePendingGroupEvents), 1);
    assert_eq!(output.report.failed(SyncPhase::MaterializePendingGroupEvents), 1);
    assert_eq!(output.report.failures().next().unwrap().item_id, "e2");
    assert!(h.local_id_on_attendee_row("e1").await.is_some());
    assert!(h.local_id_on_attendee_row("e2").await.is_none());
    assert!(h.engine.status().last_error.is_none());

    sqlx::query("DROP TRIGGER reject_write_back")
        .execute(&h.pool)
        .await
        .unwrap();
    h.run().await;
    assert_eq!(h.local.len(), 2);
    assert_eq!(
        h.local_id_on_attendee_row("e2").await,
        h.links.local_id("e2")
    );
}

#[tokio::test]
async fn test_existing_link_is_reused_for_write_back() {
    let h = harness().await;
    let event = group_event("e1", "alice", GROUP, "Dinner", 5, 19);
    let local_id = h
        .local
        .create(&LocalEventFields::from_event(&event))
        .await
        .unwrap();
    h.links.link("e1", &local_id);
    h.links.set_event_synced_at("e1", event.updated_at);
    h.invite(event, &["bob"]).await;

    let creates_before = h.local.mutation_count();
    h.run().await;

    assert_eq!(h.local.len(), 1);
    assert_eq!(h.local.mutation_count(), creates_before);
    assert_eq!(h.local_id_on_attendee_row("e1").await, Some(local_id));
}

#[tokio::test]
async fn test_materialize_guard_skips_phase() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;

    h.engine.materializing.store(true, Ordering::SeqCst);
    let output = h.run().await;

    assert_eq!(output.report.skipped(SyncPhase::MaterializePendingGroupEvents), 1);
    assert!(h.local.is_empty());
    assert!(h.engine.materializing.load(Ordering::SeqCst));

    h.engine.materializing.store(false, Ordering::SeqCst);
    h.run().await;
    assert_eq!(h.local.len(), 1);
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let h = harness().await;
    h.engine.running.store(true, Ordering::SeqCst);

    let result = h
        .engine
        .sync_at(GROUP, USER, today(), SyncTrigger::Manual)
        .await;

    assert!(matches!(result, Err(SyncError::AlreadyRunning)));
    assert_eq!(h.engine.status(), SyncStatus::default());
}

#[tokio::test]
async fn test_unreadable_local_store_aborts_run() {
    let h = harness().await;
    h.local.set_unavailable(true);

    let result = h
        .engine
        .sync_at(GROUP, USER, today(), SyncTrigger::LocalStoreChanged)
        .await;
    assert!(matches!(result, Err(SyncError::LocalStore(_))));
    let status = h.engine.status();
    assert!(status.last_finished_at.is_some());
    assert!(status.last_error.is_some());

    h.local.set_unavailable(false);
    h.run().await;
    assert!(h.engine.status().last_error.is_none());
}

#[tokio::test]
async fn test_propagates_remote_edits() {
    let h = harness().await;
    h.invite(group_event("e1", "alice", GROUP, "Dinner", 5, 19), &["bob"])
        .await;
    h.run().await;
    let local_id = h.links.local_id("e1").unwrap();

    let mut edited = events::get_event(&h.pool, "e1").await.unwrap().unwrap();
    edited.title = "Dinner at eight".into();
    edited.start = at(2026, 3, 5, 20);
    edited.end = at(2026, 3, 5, 22);
    edited.location = Some("Luigi's".into());
    let edited = events::update_event(&h.pool, &edited).await.unwrap();

    let output = h.run().await;
    assert_eq!(output.report.done(SyncPhase::PropagateModifiedGroupEvents), 1);
    let local = h.local.get(&local_id).unwrap();
    assert_eq!(local.fields.title, "Dinner at eight");
    assert_eq!(local.fields.start, at(2026, 3, 5, 20));
    assert_eq!(local.fields.location.as_deref(), Some("Luigi's"));
    assert_eq!(h.links.event_synced_at("e1"), Some(edited.updated_at));

    let mutations = h.local.mutation_count();
    h.run().await;
    assert_eq!(h.local.mutation_count(), mutations);
}

#[tokio::test]
async fn test_series_end_change_ends_local_recurrence() {
    let h = harness().await;
    h.invite(weekly_series("s1", 2), &["bob"]).await;
    h.run().await;
    let local_id = h.links.local_id("s1").unwrap();
    assert!(h.links.recurrence_end("s1").is_none());

    let mut ended = events::get_event(&h.pool, "s1").await.unwrap().unwrap();
    ended.recurrence_end_date = Some(date(2026, 3, 10));
    ended.title = "Ignored by the end-date path".into();
    events::update_event(&h.pool, &ended).await.unwrap();

    h.run().await;
    let local = h.local.get(&local_id).unwrap();
    assert_eq!(local.fields.recurrence_end, Some(date(2026, 3, 11)));
    assert_eq!(local.fields.title, "Run club");
    assert_eq!(h.links.recurrence_end("s1"), Some(date(2026, 3, 10)));
}

#[tokio::test]
async fn test_exceptions_reach_local_series() {
    let h = harness().await;
    let series = group_event("s1", "alice", GROUP, "Standup", 2, 9)
        .with_rule(&RecurrenceRule::new(Frequency::Daily))
        .unwrap();
    h.invite(series.clone(), &["bob"]).await;
    let cancelled = exception_of(&series, "s1-cancel", date(2026, 3, 4), true);
    let mut moved = exception_of(&series, "s1-move", date(2026, 3, 5), false);
    moved.start = at(2026, 3, 5, 11);
    moved.end = at(2026, 3, 5, 12);
    events::create_event(&h.pool, &cancelled).await.unwrap();
    events::create_event(&h.pool, &moved).await.unwrap();

    let output = h.run().await;
    let local_id = h.links.local_id("s1").unwrap();

    assert_eq!(output.report.done(SyncPhase::PropagateRecurrenceExceptions), 2);
    assert_eq!(h.local.deleted_occurrences(&local_id), vec![date(2026, 3, 4)]);
    let moved_fields = h.local.occurrence_override(&local_id, date(2026, 3, 5)).unwrap();
    assert_eq!(moved_fields.start, at(2026, 3, 5, 11));

    let merged_days: Vec<_> = output
        .merged
        .for_day(date(2026, 3, 4))
        .iter()
        .map(|e| e.event.id.clone())
        .collect();
    assert!(merged_days.is_empty());

    let mutations = h.local.mutation_count();
    h.run().await;
    assert_eq!(h.local.mutation_count(), mutations);
}

#[tokio::test]
async fn test_exception_without_local_series_is_skipped() {
    let h = harness().await;
    let series = weekly_series("s1", 2);
    // Alice's series; bob is a member of the group but not invited.
    h.invite(series.clone(), &["alice"]).await;
    events::create_event(&h.pool, &exception_of(&series, "s1-x", date(2026, 3, 9), true))
        .await
        .unwrap();

    let output = h.run().await;
    assert_eq!(output.report.skipped(SyncPhase::PropagateRecurrenceExceptions), 1);
    assert!(h.local.is_empty());
}

#[tokio::test]
async fn test_link_store_persists_between_engines() {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::test_pool().await;
    groups::add_member(&pool, GROUP, USER).await.unwrap();
    events::create_event(&pool, &group_event("e1", "alice", GROUP, "Dinner", 5, 19))
        .await
        .unwrap();
    attendees::add_attendee(&pool, "e1", Some(USER), None, AttendeeStatus::Invited)
        .await
        .unwrap();
    let local = Arc::new(MemoryLocalStore::new());

    let links = Arc::new(LinkStore::open(dir.path()).await.unwrap());
    let engine = SyncEngine::new(pool.clone(), local.clone(), links);
    engine
        .sync_at(GROUP, USER, today(), SyncTrigger::Manual)
        .await
        .unwrap();

    let reopened = LinkStore::open(dir.path()).await.unwrap();
    assert!(reopened.local_id("e1").is_some());
}

#[test]
fn test_report_counts() {
    let mut report = SyncReport::default();
    report.record(SyncPhase::CleanupDeleted, "a", ItemOutcome::Done);
    report.record(SyncPhase::CleanupDeleted, "b", ItemOutcome::Skipped("x".into()));
    report.fail(
        SyncPhase::UploadPersonalEvents,
        "c",
        &SyncError::Conflict("dup".into()),
    );

    assert_eq!(report.done(SyncPhase::CleanupDeleted), 1);
    assert_eq!(report.skipped(SyncPhase::CleanupDeleted), 1);
    assert_eq!(report.failed(SyncPhase::UploadPersonalEvents), 1);
    assert_eq!(report.failures().count(), 1);
    assert_eq!(SyncPhase::FetchMerged.to_string(), "fetch_merged");
}
