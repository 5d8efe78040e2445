use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::Row;

use super::Store;
use crate::models::{Analysis, Effectiveness, ImprovementLevel, Recommendation};
use crate::utils::error::{AppError, AppResult};

fn row_to_analysis(row: &sqlx::sqlite::SqliteRow) -> AppResult<Analysis> {
    let improvement_level: String = row.try_get("improvement_level")?;
    let effectiveness: String = row.try_get("effectiveness")?;
    let created_at: String = row.try_get("created_at")?;
    let recommendations_json: String = row.try_get("recommendations")?;

    Ok(Analysis {
        id: row.try_get("id")?,
        observation_id: row.try_get("observation_id")?,
        problem: row.try_get("problem")?,
        root_cause: row.try_get("root_cause")?,
        recommendations: serde_json::from_str::<Vec<Recommendation>>(&recommendations_json)
            .map_err(|e| AppError::Internal(e.to_string()))?,
        improvement_level: ImprovementLevel::parse(&improvement_level).map_err(AppError::Internal)?,
        effectiveness: Effectiveness::parse(&effectiveness).map_err(AppError::Internal)?,
        gain_ratio: row.try_get("gain_ratio")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .with_timezone(&Utc),
        provider: row.try_get("provider")?,
        model_version: row.try_get("model_version")?,
    })
}

impl Store {
    /// Analyses with `effectiveness=PENDING` created at least `min_age` ago
    /// (§4.2, default 10 minutes) — the Learning Evaluator's drain query.
    pub async fn pending_analyses(&self, min_age: ChronoDuration, limit: i64) -> AppResult<Vec<Analysis>> {
        let cutoff = (Utc::now() - min_age).to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM analyses WHERE effectiveness = 'PENDING' AND created_at <= ? ORDER BY created_at ASC LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_analysis).collect()
    }

    pub async fn get_analysis(&self, id: i64) -> AppResult<Option<Analysis>> {
        let row = sqlx::query("SELECT * FROM analyses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_analysis).transpose()
    }

    pub async fn get_analysis_for_observation(&self, observation_id: i64) -> AppResult<Option<Analysis>> {
        let row = sqlx::query("SELECT * FROM analyses WHERE observation_id = ? ORDER BY created_at DESC LIMIT 1")
            .bind(observation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_analysis).transpose()
    }

    /// Terminalises a PENDING analysis as CONFIRMED or FAILED with its
    /// computed gain ratio (§4.6 step 7). Only PENDING rows are affected —
    /// once left, effectiveness never changes again (P4).
    pub async fn set_analysis_effectiveness(
        &self,
        analysis_id: i64,
        effectiveness: Effectiveness,
        gain_ratio: Option<f64>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE analyses SET effectiveness = ?, gain_ratio = ? WHERE id = ? AND effectiveness = 'PENDING'",
        )
        .bind(effectiveness.as_str())
        .bind(gain_ratio)
        .bind(analysis_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Auto-FAILs any PENDING analysis older than `max_pending_age`, with a
    /// NULL gain_ratio, to bound unbounded pending growth (§4.6 tie-break
    /// policy).
    pub async fn terminalize_stale_pending(&self, max_pending_age: ChronoDuration) -> AppResult<u64> {
        let cutoff = (Utc::now() - max_pending_age).to_rfc3339();
        let result = sqlx::query(
            "UPDATE analyses SET effectiveness = 'FAILED', gain_ratio = NULL WHERE effectiveness = 'PENDING' AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewAnalysis, NewObservation, SourceType};
    use crate::store::test_store;

    async fn seed_analysis(store: &Store) -> i64 {
        let obs = NewObservation {
            source_type: SourceType::Mysql,
            source_host: "db1".into(),
            source_database: "app".into(),
            fingerprint: "fp".into(),
            full_sql: "select 1".into(),
            duration_ms: 500.0,
            rows_examined: None,
            rows_returned: None,
            captured_at: Utc::now() - ChronoDuration::hours(1),
            plan: None,
            tenant_scope: "t".into(),
        };
        let (id, _) = store.insert_observation(obs).await.unwrap();
        store.claim_new_observations(10).await.unwrap();
        store
            .finalize_analysis(
                id,
                NewAnalysis {
                    problem: "p".into(),
                    root_cause: "r".into(),
                    recommendations: vec![],
                    improvement_level: ImprovementLevel::Low,
                    provider: "rules".into(),
                    model_version: "v1".into(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn effectiveness_transition_is_terminal() {
        let store = test_store().await;
        let analysis_id = seed_analysis(&store).await;

        let changed = store
            .set_analysis_effectiveness(analysis_id, Effectiveness::Confirmed, Some(0.5))
            .await
            .unwrap();
        assert!(changed);

        // Second attempt must be a no-op: PENDING guard blocks it (P4).
        let changed_again = store
            .set_analysis_effectiveness(analysis_id, Effectiveness::Failed, None)
            .await
            .unwrap();
        assert!(!changed_again);

        let analysis = store.get_analysis(analysis_id).await.unwrap().unwrap();
        assert_eq!(analysis.effectiveness, Effectiveness::Confirmed);
    }

    #[tokio::test]
    async fn stale_pending_auto_fails() {
        let store = test_store().await;
        let analysis_id = seed_analysis(&store).await;

        let changed = store.terminalize_stale_pending(ChronoDuration::seconds(0)).await.unwrap();
        assert_eq!(changed, 1);

        let analysis = store.get_analysis(analysis_id).await.unwrap().unwrap();
        assert_eq!(analysis.effectiveness, Effectiveness::Failed);
        assert!(analysis.gain_ratio.is_none());
    }
}
