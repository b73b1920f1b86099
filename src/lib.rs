//! Group calendar sync: reconciles a device calendar with a shared group event
//! store and produces a merged, deduplicated view of both.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod links;
pub mod local;
pub mod merge;
pub mod rain_check;
pub mod recurrence;
pub mod sync;
pub mod window;

#[cfg(test)]
mod testutil;

pub use error::{SyncError, SyncResult};
pub use sync::{SyncEngine, SyncOutput, SyncReport, SyncStatus};
