//! The sync pipeline: one run reconciles a user's device calendar with one group's
//! remote rows and returns the merged view.

mod cleanup;
mod fetch;
mod materialize;
mod propagate;
mod upload;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{SyncError, SyncResult};
use crate::links::LinkStore;
use crate::local::{LocalEvent, LocalStore};
use crate::merge::MergedEventSet;
use crate::window::DateWindow;

/// Default number of days after today covered by a run.
pub const DEFAULT_WINDOW_DAYS: i64 = 14;

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    RefreshLocal,
    CleanupDeleted,
    MaterializePendingGroupEvents,
    PropagateModifiedGroupEvents,
    PropagateRecurrenceExceptions,
    UploadPersonalEvents,
    FetchMerged,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RefreshLocal => "refresh_local",
            Self::CleanupDeleted => "cleanup_deleted",
            Self::MaterializePendingGroupEvents => "materialize_pending_group_events",
            Self::PropagateModifiedGroupEvents => "propagate_modified_group_events",
            Self::PropagateRecurrenceExceptions => "propagate_recurrence_exceptions",
            Self::UploadPersonalEvents => "upload_personal_events",
            Self::FetchMerged => "fetch_merged",
        };
        f.write_str(name)
    }
}

/// Result of handling one item inside a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub phase: SyncPhase,
    pub item_id: String,
    pub outcome: ItemOutcome,
}

/// Everything that happened to individual items during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub items: Vec<ItemResult>,
    /// Personal rows inserted or changed by the upload phase.
    pub uploaded: u64,
}

impl SyncReport {
    pub(crate) fn record(&mut self, phase: SyncPhase, item_id: impl Into<String>, outcome: ItemOutcome) {
        let item_id = item_id.into();
        match &outcome {
            ItemOutcome::Done => tracing::debug!(%phase, item_id = %item_id, "Item synced"),
            ItemOutcome::Skipped(reason) => {
                tracing::debug!(%phase, item_id = %item_id, reason = %reason, "Item skipped")
            }
            ItemOutcome::Failed(reason) => {
                tracing::warn!(%phase, item_id = %item_id, error = %reason, "Item failed")
            }
        }
        self.items.push(ItemResult {
            phase,
            item_id,
            outcome,
        });
    }

    pub(crate) fn fail(&mut self, phase: SyncPhase, item_id: impl Into<String>, error: &SyncError) {
        self.record(phase, item_id, ItemOutcome::Failed(error.to_string()));
    }

    /// Items of a phase with a given outcome kind.
    pub fn in_phase(&self, phase: SyncPhase) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(move |i| i.phase == phase)
    }

    pub fn done(&self, phase: SyncPhase) -> usize {
        self.in_phase(phase)
            .filter(|i| i.outcome == ItemOutcome::Done)
            .count()
    }

    pub fn skipped(&self, phase: SyncPhase) -> usize {
        self.in_phase(phase)
            .filter(|i| matches!(i.outcome, ItemOutcome::Skipped(_)))
            .count()
    }

    pub fn failed(&self, phase: SyncPhase) -> usize {
        self.in_phase(phase)
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed(_)))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed(_)))
    }

    fn summarize(&self, phase: SyncPhase) {
        tracing::info!(
            %phase,
            done = self.done(phase),
            skipped = self.skipped(phase),
            failed = self.failed(phase),
            "Phase finished"
        );
    }
}

/// What asked for a run. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Manual,
    LocalStoreChanged,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::LocalStoreChanged => f.write_str("local_store_changed"),
        }
    }
}

/// Outcome of the most recent finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct SyncOutput {
    pub merged: MergedEventSet,
    pub report: SyncReport,
}

/// Clears its flag when dropped, so an aborted run never leaves the engine locked.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared by the phases of one run.
pub(crate) struct RunContext<'a> {
    pub pool: &'a SqlitePool,
    pub local: &'a dyn LocalStore,
    pub links: &'a LinkStore,
    pub group_id: &'a str,
    pub user_id: &'a str,
    pub window: DateWindow,
    /// Last read of the device calendar.
    pub local_events: Vec<LocalEvent>,
    pub report: SyncReport,
}

impl RunContext<'_> {
    async fn refresh_local(&mut self) -> SyncResult<()> {
        self.local_events = self.local.query(&self.window).await?;
        tracing::debug!(count = self.local_events.len(), "Local window refreshed");
        Ok(())
    }
}

/// Sequences the sync phases for one device.
pub struct SyncEngine {
    pool: SqlitePool,
    local: Arc<dyn LocalStore>,
    links: Arc<LinkStore>,
    window_days: i64,
    tz: Tz,
    running: AtomicBool,
    materializing: AtomicBool,
    status: Mutex<SyncStatus>,
}

impl SyncEngine {
    pub fn new(pool: SqlitePool, local: Arc<dyn LocalStore>, links: Arc<LinkStore>) -> Self {
        Self {
            pool,
            local,
            links,
            window_days: DEFAULT_WINDOW_DAYS,
            tz: Tz::UTC,
            running: AtomicBool::new(false),
            materializing: AtomicBool::new(false),
            status: Mutex::new(SyncStatus::default()),
        }
    }

    /// Use a different window length and zone.
    pub fn with_window(mut self, days: i64, tz: Tz) -> Self {
        self.window_days = days;
        self.tz = tz;
        self
    }

    pub fn links(&self) -> &LinkStore {
        &self.links
    }

    pub fn status(&self) -> SyncStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run a full sync for `user_id` in `group_id`, windowed from today.
    pub async fn sync(&self, group_id: &str, user_id: &str) -> SyncResult<SyncOutput> {
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        self.sync_at(group_id, user_id, today, SyncTrigger::Manual)
            .await
    }

    /// Called by the host when the device calendar reports a change.
    pub async fn local_store_changed(&self, group_id: &str, user_id: &str) -> SyncResult<SyncOutput> {
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        self.sync_at(group_id, user_id, today, SyncTrigger::LocalStoreChanged)
            .await
    }

    /// Run a full sync with the window starting on `today`.
    pub async fn sync_at(
        &self,
        group_id: &str,
        user_id: &str,
        today: NaiveDate,
        trigger: SyncTrigger,
    ) -> SyncResult<SyncOutput> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            tracing::info!(group_id, user_id, %trigger, "Sync already running");
            return Err(SyncError::AlreadyRunning);
        };

        let window = DateWindow::starting(today, self.window_days, self.tz);
        tracing::info!(
            group_id,
            user_id,
            %trigger,
            from = %window.from,
            to = %window.to,
            "Sync started"
        );

        let result = self.run(group_id, user_id, window).await;
        let flushed = self.links.flush().await;

        let result = match (result, flushed) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), flushed) => {
                if let Err(flush_err) = flushed {
                    tracing::warn!(error = %flush_err, "Failed to persist link store");
                }
                Err(e)
            }
        };

        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.last_finished_at = Some(Utc::now());
        match &result {
            Ok(output) => {
                status.last_error = None;
                tracing::info!(
                    group_id,
                    user_id,
                    events = output.merged.len(),
                    failures = output.report.failures().count(),
                    "Sync finished"
                );
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                tracing::error!(group_id, user_id, error = %e, "Sync failed");
            }
        }

        result
    }

    async fn run(&self, group_id: &str, user_id: &str, window: DateWindow) -> SyncResult<SyncOutput> {
        let mut ctx = RunContext {
            pool: &self.pool,
            local: self.local.as_ref(),
            links: &self.links,
            group_id,
            user_id,
            window,
            local_events: Vec::new(),
            report: SyncReport::default(),
        };

        ctx.refresh_local().await?;

        cleanup::run(&mut ctx).await?;
        ctx.report.summarize(SyncPhase::CleanupDeleted);

        // Phase 3 keeps its own guard for callers that run it outside the run guard.
        match RunGuard::acquire(&self.materializing) {
            Some(_guard) => materialize::run(&mut ctx).await?,
            None => ctx.report.record(
                SyncPhase::MaterializePendingGroupEvents,
                user_id,
                ItemOutcome::Skipped("materialization already in progress".into()),
            ),
        }
        ctx.report.summarize(SyncPhase::MaterializePendingGroupEvents);

        propagate::modified_events(&mut ctx).await?;
        ctx.report.summarize(SyncPhase::PropagateModifiedGroupEvents);

        propagate::exceptions(&mut ctx).await?;
        ctx.report.summarize(SyncPhase::PropagateRecurrenceExceptions);

        ctx.refresh_local().await?;

        upload::run(&mut ctx).await?;
        tracing::info!(
            phase = %SyncPhase::UploadPersonalEvents,
            uploaded = ctx.report.uploaded,
            "Phase finished"
        );

        let merged = fetch::run(&ctx).await?;

        Ok(SyncOutput {
            merged,
            report: ctx.report,
        })
    }
}

/// Delete a local item, treating "already gone" as success.
pub(crate) async fn delete_local(local: &dyn LocalStore, local_id: &str) -> SyncResult<()> {
    match local.delete(local_id).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Split an item-level error into "abort the run" and "record and move on".
pub(crate) fn item_error(report: &mut SyncReport, phase: SyncPhase, item_id: &str, error: SyncError) -> SyncResult<()> {
    if error.is_fatal() {
        return Err(error);
    }
    report.fail(phase, item_id, &error);
    Ok(())
}

#[cfg(test)]
mod tests;
