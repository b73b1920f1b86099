use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::PendingDeletion;
use crate::error::SyncResult;

/// Queue removal of a local copy from one user's device.
pub async fn enqueue_deletion(
    pool: &SqlitePool,
    user_id: &str,
    local_event_id: &str,
) -> SyncResult<PendingDeletion> {
    let id = Uuid::now_v7().to_string();
    sqlx::query(
        "INSERT INTO pending_local_deletions (id, user_id, local_event_id, consumed, created_at)
         VALUES (?, ?, ?, 0, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(local_event_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let row = sqlx::query_as::<_, PendingDeletion>(
        "SELECT * FROM pending_local_deletions WHERE id = ?",
    )
    .bind(&id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Unconsumed deletions for a user, oldest first.
pub async fn list_pending(pool: &SqlitePool, user_id: &str) -> SyncResult<Vec<PendingDeletion>> {
    let rows = sqlx::query_as::<_, PendingDeletion>(
        "SELECT * FROM pending_local_deletions
         WHERE user_id = ? AND consumed = 0
         ORDER BY created_at, id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Mark a queue row consumed. Consuming twice is harmless.
pub async fn mark_consumed(pool: &SqlitePool, id: &str) -> SyncResult<()> {
    sqlx::query("UPDATE pending_local_deletions SET consumed = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
