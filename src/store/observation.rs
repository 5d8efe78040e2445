use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Store;
use crate::models::{NewAnalysis, NewObservation, Observation, ObservationStatus, SourceType};
use crate::utils::error::{AppError, AppResult};

fn row_to_observation(row: &sqlx::sqlite::SqliteRow) -> AppResult<Observation> {
    let source_type: String = row.try_get("source_type")?;
    let status: String = row.try_get("status")?;
    let captured_at: String = row.try_get("captured_at")?;
    let claimed_at: Option<String> = row.try_get("claimed_at")?;

    Ok(Observation {
        id: row.try_get("id")?,
        source_type: SourceType::parse(&source_type)
            .map_err(AppError::Internal)?,
        source_host: row.try_get("source_host")?,
        source_database: row.try_get("source_database")?,
        fingerprint: row.try_get("fingerprint")?,
        full_sql: row.try_get("full_sql")?,
        duration_ms: row.try_get("duration_ms")?,
        rows_examined: row.try_get("rows_examined")?,
        rows_returned: row.try_get("rows_returned")?,
        captured_at: DateTime::parse_from_rfc3339(&captured_at)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .with_timezone(&Utc),
        plan: row.try_get("plan")?,
        status: ObservationStatus::parse(&status).map_err(AppError::Internal)?,
        tenant_scope: row.try_get("tenant_scope")?,
        claimed_at: claimed_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| AppError::Internal(e.to_string()))
            })
            .transpose()?,
    })
}

impl Store {
    /// Dedup seam (§4.2): returns `(id, inserted)`. `inserted=false` means a
    /// row with the same (fingerprint, captured_at, source_host) already
    /// existed and the insert was a no-op (P2).
    pub async fn insert_observation(&self, obs: NewObservation) -> AppResult<(i64, bool)> {
        let existing = sqlx::query(
            "SELECT id FROM observations WHERE fingerprint = ? AND captured_at = ? AND source_host = ?",
        )
        .bind(&obs.fingerprint)
        .bind(obs.captured_at.to_rfc3339())
        .bind(&obs.source_host)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let id: i64 = row.try_get("id")?;
            return Ok((id, false));
        }

        let result = sqlx::query(
            r#"INSERT INTO observations
                (source_type, source_host, source_database, fingerprint, full_sql,
                 duration_ms, rows_examined, rows_returned, captured_at, plan, status, tenant_scope)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'NEW', ?)"#,
        )
        .bind(obs.source_type.as_str())
        .bind(&obs.source_host)
        .bind(&obs.source_database)
        .bind(&obs.fingerprint)
        .bind(&obs.full_sql)
        .bind(obs.duration_ms)
        .bind(obs.rows_examined)
        .bind(obs.rows_returned)
        .bind(obs.captured_at.to_rfc3339())
        .bind(&obs.plan)
        .bind(&obs.tenant_scope)
        .execute(&self.pool)
        .await;

        match result {
            Ok(res) => Ok((res.last_insert_rowid(), true)),
            // Concurrent insert raced us past the existence check; the unique
            // index is the real dedup authority (P2), so treat the conflict
            // as "already present" rather than an error.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let row = sqlx::query(
                    "SELECT id FROM observations WHERE fingerprint = ? AND captured_at = ? AND source_host = ?",
                )
                .bind(&obs.fingerprint)
                .bind(obs.captured_at.to_rfc3339())
                .bind(&obs.source_host)
                .fetch_one(&self.pool)
                .await?;
                Ok((row.try_get("id")?, false))
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claims up to `limit` NEW observations by flipping them to
    /// IN_FLIGHT with a fresh `claimed_at` (§4.2, §5's logical lease).
    pub async fn claim_new_observations(&self, limit: i64) -> AppResult<Vec<Observation>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let ids: Vec<i64> = sqlx::query(
            "SELECT id FROM observations WHERE status = 'NEW' ORDER BY captured_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| r.try_get::<i64, _>("id"))
        .collect::<Result<_, _>>()?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        for id in &ids {
            sqlx::query("UPDATE observations SET status = 'IN_FLIGHT', claimed_at = ? WHERE id = ? AND status = 'NEW'")
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!("SELECT * FROM observations WHERE id IN ({placeholders})");
        let mut q = sqlx::query(&query);
        for id in &ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&mut *tx).await?;
        tx.commit().await?;

        rows.iter().map(row_to_observation).collect()
    }

    /// Reverts IN_FLIGHT rows whose claim has outlived the configured claim
    /// timeout back to NEW (§4.2, P7, and the shutdown-release rule of §5).
    pub async fn release_expired_claims(&self) -> AppResult<u64> {
        let cutoff = (Utc::now() - self.claim_timeout).to_rfc3339();
        let result = sqlx::query(
            "UPDATE observations SET status = 'NEW', claimed_at = NULL WHERE status = 'IN_FLIGHT' AND claimed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Releases every currently IN_FLIGHT claim immediately, regardless of
    /// age — used on graceful scheduler shutdown (§5: "in-flight claims are
    /// released rather than finalised with partial data").
    pub async fn release_all_claims(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE observations SET status = 'NEW', claimed_at = NULL WHERE status = 'IN_FLIGHT'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Atomically flips the observation to ANALYZED and inserts its Analysis.
    /// Fails if the observation is not currently IN_FLIGHT (someone else's
    /// claim already finalised or released it).
    pub async fn finalize_analysis(&self, observation_id: i64, analysis: NewAnalysis) -> AppResult<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE observations SET status = 'ANALYZED', claimed_at = NULL WHERE id = ? AND status = 'IN_FLIGHT'")
            .bind(observation_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Validation(format!(
                "observation {observation_id} is not IN_FLIGHT; cannot finalize"
            )));
        }

        let recommendations_json = serde_json::to_string(&analysis.recommendations)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            r#"INSERT INTO analyses
                (observation_id, problem, root_cause, recommendations, improvement_level,
                 effectiveness, gain_ratio, created_at, provider, model_version)
               VALUES (?, ?, ?, ?, ?, 'PENDING', NULL, ?, ?, ?)"#,
        )
        .bind(observation_id)
        .bind(&analysis.problem)
        .bind(&analysis.root_cause)
        .bind(&recommendations_json)
        .bind(analysis.improvement_level.as_str())
        .bind(&now)
        .bind(&analysis.provider)
        .bind(&analysis.model_version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.last_insert_rowid())
    }

    /// Moves an observation to the terminal ERROR state outside the
    /// NEW/IN_FLIGHT/ANALYZED cycle (§7, data-integrity errors).
    pub async fn quarantine_observation(&self, observation_id: i64, reason: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE observations SET status = 'ERROR', claimed_at = NULL WHERE id = ? AND status != 'ANALYZED'",
        )
        .bind(observation_id)
        .execute(&self.pool)
        .await?;
        tracing::warn!(observation_id, reason, "observation quarantined");
        Ok(())
    }

    pub async fn get_observation(&self, id: i64) -> AppResult<Option<Observation>> {
        let row = sqlx::query("SELECT * FROM observations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_observation).transpose()
    }

    /// Ordered-by-`captured_at` observations for a fingerprint with
    /// `captured_at > after` (§4.2) — the Learning Evaluator's post-window.
    /// When more than `limit` rows qualify, the *most recent* `limit` are
    /// returned (§4.6 step 4), in ascending `captured_at` order.
    pub async fn post_observations(
        &self,
        fingerprint: &str,
        after: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Observation>> {
        let rows = sqlx::query(
            "SELECT * FROM observations WHERE fingerprint = ? AND captured_at > ? ORDER BY captured_at DESC LIMIT ?",
        )
        .bind(fingerprint)
        .bind(after.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut observations = rows.iter().map(row_to_observation).collect::<AppResult<Vec<_>>>()?;
        observations.reverse();
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn sample(fingerprint: &str, host: &str, captured_at: DateTime<Utc>) -> NewObservation {
        NewObservation {
            source_type: SourceType::Mysql,
            source_host: host.to_string(),
            source_database: "app".to_string(),
            fingerprint: fingerprint.to_string(),
            full_sql: "select * from t where id = ?".to_string(),
            duration_ms: 120.0,
            rows_examined: Some(1000),
            rows_returned: Some(1),
            captured_at,
            plan: None,
            tenant_scope: "tenant-a".to_string(),
        }
    }

    #[tokio::test]
    async fn dedup_on_identical_key() {
        let store = test_store().await;
        let t = Utc::now();
        let (id1, inserted1) = store.insert_observation(sample("fp1", "db1", t)).await.unwrap();
        assert!(inserted1);
        let (id2, inserted2) = store.insert_observation(sample("fp1", "db1", t)).await.unwrap();
        assert!(!inserted2);
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn claim_transitions_to_in_flight_and_excludes_on_second_claim() {
        let store = test_store().await;
        store.insert_observation(sample("fp2", "db1", Utc::now())).await.unwrap();

        let claimed = store.claim_new_observations(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, ObservationStatus::InFlight);

        let claimed_again = store.claim_new_observations(10).await.unwrap();
        assert!(claimed_again.is_empty());
    }

    #[tokio::test]
    async fn finalize_analysis_requires_in_flight() {
        let store = test_store().await;
        let (id, _) = store.insert_observation(sample("fp3", "db1", Utc::now())).await.unwrap();

        let analysis = NewAnalysis {
            problem: "slow scan".into(),
            root_cause: "missing index".into(),
            recommendations: vec![],
            improvement_level: crate::models::ImprovementLevel::Medium,
            provider: "rules".into(),
            model_version: "v1".into(),
        };

        // Not yet claimed -> still NEW, finalize must fail.
        assert!(store.finalize_analysis(id, analysis.clone()).await.is_err());

        store.claim_new_observations(10).await.unwrap();
        let analysis_id = store.finalize_analysis(id, analysis).await.unwrap();
        assert!(analysis_id > 0);

        let obs = store.get_observation(id).await.unwrap().unwrap();
        assert_eq!(obs.status, ObservationStatus::Analyzed);
    }

    #[tokio::test]
    async fn release_expired_claims_reverts_to_new() {
        let store = Store::connect("sqlite::memory:", 5, 0, 3600).await.unwrap();
        store.insert_observation(sample("fp4", "db1", Utc::now())).await.unwrap();
        store.claim_new_observations(10).await.unwrap();

        let released = store.release_expired_claims().await.unwrap();
        assert_eq!(released, 1);

        let reclaimed = store.claim_new_observations(10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn post_observations_returns_most_recent_n_in_ascending_order() {
        let store = test_store().await;
        let base = Utc::now();
        for (i, duration) in [100.0, 200.0, 300.0, 400.0, 500.0, 600.0].into_iter().enumerate() {
            let mut obs = sample("fp5", "db1", base + chrono::Duration::minutes(i as i64));
            obs.duration_ms = duration;
            store.insert_observation(obs).await.unwrap();
        }

        let window = store.post_observations("fp5", base - chrono::Duration::minutes(1), 3).await.unwrap();
        assert_eq!(window.len(), 3);
        // Most recent 3 samples (400, 500, 600), not the oldest 3 (100, 200, 300).
        assert_eq!(window.iter().map(|o| o.duration_ms).collect::<Vec<_>>(), vec![400.0, 500.0, 600.0]);
        // Returned in ascending captured_at order per the §4.2 contract.
        assert!(window.windows(2).all(|w| w[0].captured_at < w[1].captured_at));
    }
}
