use sqlx::SqlitePool;

use crate::error::SyncResult;

/// Add a user to a group. Adding an existing member is a no-op.
pub async fn add_member(pool: &SqlitePool, group_id: &str, user_id: &str) -> SyncResult<()> {
    sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?, ?)")
        .bind(group_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a user from a group.
pub async fn remove_member(pool: &SqlitePool, group_id: &str, user_id: &str) -> SyncResult<()> {
    sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// User ids of a group's members, sorted.
pub async fn list_members(pool: &SqlitePool, group_id: &str) -> SyncResult<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT user_id FROM group_members WHERE group_id = ? ORDER BY user_id")
            .bind(group_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
