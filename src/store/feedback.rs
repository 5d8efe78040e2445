use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Store;
use crate::models::{FeedbackEntry, NewFeedbackEntry};
use crate::utils::error::{AppError, AppResult};

fn row_to_feedback(row: &sqlx::sqlite::SqliteRow) -> AppResult<FeedbackEntry> {
    let checked_at: String = row.try_get("checked_at")?;
    Ok(FeedbackEntry {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        analysis_id: row.try_get("analysis_id")?,
        old_duration_ms: row.try_get("old_duration_ms")?,
        new_duration_ms: row.try_get("new_duration_ms")?,
        gain_ratio: row.try_get("gain_ratio")?,
        checked_at: DateTime::parse_from_rfc3339(&checked_at)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

impl Store {
    /// Idempotent per `analysis_id` within the configured idempotency window
    /// (P5): if a recent entry already exists for this analysis, this call is
    /// a no-op that returns the existing entry instead of inserting a second
    /// one.
    pub async fn record_feedback(&self, entry: NewFeedbackEntry) -> AppResult<FeedbackEntry> {
        let window_start = (Utc::now() - self.feedback_idempotency).to_rfc3339();
        let existing = sqlx::query(
            "SELECT * FROM feedback_entries WHERE analysis_id = ? AND checked_at >= ? ORDER BY checked_at DESC LIMIT 1",
        )
        .bind(entry.analysis_id)
        .bind(&window_start)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return row_to_feedback(&row);
        }

        let result = sqlx::query(
            r#"INSERT INTO feedback_entries
                (fingerprint, analysis_id, old_duration_ms, new_duration_ms, gain_ratio, checked_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&entry.fingerprint)
        .bind(entry.analysis_id)
        .bind(entry.old_duration_ms)
        .bind(entry.new_duration_ms)
        .bind(entry.gain_ratio)
        .bind(entry.checked_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM feedback_entries WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        row_to_feedback(&row)
    }

    /// Timeline of FeedbackEntries for a fingerprint, oldest first — backs
    /// the `GET /slow-queries/{id}` detail view (§6).
    pub async fn feedback_timeline(&self, fingerprint: &str) -> AppResult<Vec<FeedbackEntry>> {
        let rows = sqlx::query("SELECT * FROM feedback_entries WHERE fingerprint = ? ORDER BY checked_at ASC")
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_feedback).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn entry(analysis_id: i64) -> NewFeedbackEntry {
        NewFeedbackEntry {
            fingerprint: "fp".into(),
            analysis_id,
            old_duration_ms: 1000.0,
            new_duration_ms: 200.0,
            gain_ratio: 0.8,
            checked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeated_feedback_is_idempotent_within_window() {
        let store = test_store().await;
        let first = store.record_feedback(entry(1)).await.unwrap();
        let second = store.record_feedback(entry(1)).await.unwrap();
        assert_eq!(first.id, second.id);

        let timeline = store.feedback_timeline("fp").await.unwrap();
        assert_eq!(timeline.len(), 1);
    }
}
