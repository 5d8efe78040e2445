use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use super::Store;
use crate::models::{
    DashboardStats, Effectiveness, FingerprintSummary, GainBucket, SourceType, TopRecommendation,
};
use crate::utils::error::{AppError, AppResult};

#[derive(Debug, Default, Clone)]
pub struct SlowQueryFilters {
    pub source_type: Option<SourceType>,
    pub min_duration_ms: Option<f64>,
    pub limit: i64,
    pub offset: i64,
}

impl Store {
    /// Backs `GET /slow-queries` (§6): one row per fingerprint with the best
    /// observed effectiveness and the current average duration.
    pub async fn summarise_by_fingerprint(
        &self,
        filters: SlowQueryFilters,
    ) -> AppResult<Vec<FingerprintSummary>> {
        let mut sql = String::from(
            r#"SELECT
                o.fingerprint AS fingerprint,
                (SELECT full_sql FROM observations o2 WHERE o2.fingerprint = o.fingerprint ORDER BY captured_at DESC LIMIT 1) AS sample_sql,
                AVG(o.duration_ms) AS avg_duration_ms,
                COUNT(*) AS observation_count,
                MAX(o.captured_at) AS last_seen,
                (SELECT a.effectiveness FROM analyses a WHERE a.observation_id IN
                    (SELECT id FROM observations o3 WHERE o3.fingerprint = o.fingerprint)
                 ORDER BY CASE a.effectiveness
                    WHEN 'CONFIRMED' THEN 0 WHEN 'PENDING' THEN 1 WHEN 'FAILED' THEN 2 END ASC
                 LIMIT 1) AS best_effectiveness,
                (SELECT MAX(a.gain_ratio) FROM analyses a WHERE a.effectiveness = 'CONFIRMED' AND a.observation_id IN
                    (SELECT id FROM observations o4 WHERE o4.fingerprint = o.fingerprint)) AS max_confirmed_gain
               FROM observations o
               WHERE 1 = 1"#,
        );

        if filters.source_type.is_some() {
            sql.push_str(" AND o.source_type = ?");
        }
        if filters.min_duration_ms.is_some() {
            sql.push_str(" AND o.duration_ms >= ?");
        }
        sql.push_str(" GROUP BY o.fingerprint ORDER BY last_seen DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(st) = filters.source_type {
            q = q.bind(st.as_str());
        }
        if let Some(d) = filters.min_duration_ms {
            q = q.bind(d);
        }
        q = q.bind(filters.limit).bind(filters.offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let last_seen: String = row.try_get("last_seen")?;
                let best_effectiveness: Option<String> = row.try_get("best_effectiveness")?;
                Ok(FingerprintSummary {
                    fingerprint: row.try_get("fingerprint")?,
                    sample_sql: row.try_get::<Option<String>, _>("sample_sql")?.unwrap_or_default(),
                    avg_duration_ms: row.try_get("avg_duration_ms")?,
                    observation_count: row.try_get("observation_count")?,
                    best_effectiveness: best_effectiveness
                        .map(|s| Effectiveness::parse(&s))
                        .transpose()
                        .map_err(AppError::Internal)?,
                    max_confirmed_gain: row.try_get("max_confirmed_gain")?,
                    last_seen: DateTime::parse_from_rfc3339(&last_seen)
                        .map_err(|e| AppError::Internal(e.to_string()))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    /// CONFIRMED recommendations grouped by rule kind, ordered by mean gain
    /// (§4.2, §4.6) — the signal the Analyzer re-ranks its oracle prompt with.
    pub async fn top_recommendations(&self, rule_kind: Option<&str>) -> AppResult<Vec<TopRecommendation>> {
        // Recommendations are stored as a JSON array per analysis; SQLite's
        // json_each table-valued function unnests them for aggregation.
        let mut sql = String::from(
            r#"SELECT
                json_extract(rec.value, '$.kind') AS kind,
                json_extract(rec.value, '$.description') AS sample_description,
                AVG(a.gain_ratio) AS mean_gain_ratio,
                COUNT(*) AS confirmed_count
               FROM analyses a, json_each(a.recommendations) AS rec
               WHERE a.effectiveness = 'CONFIRMED'"#,
        );
        if rule_kind.is_some() {
            sql.push_str(" AND json_extract(rec.value, '$.kind') = ?");
        }
        sql.push_str(" GROUP BY kind ORDER BY mean_gain_ratio DESC");

        let mut q = sqlx::query(&sql);
        if let Some(k) = rule_kind {
            q = q.bind(k);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(TopRecommendation {
                    kind: row.try_get("kind")?,
                    sample_description: row.try_get("sample_description")?,
                    mean_gain_ratio: row.try_get("mean_gain_ratio")?,
                    confirmed_count: row.try_get("confirmed_count")?,
                })
            })
            .collect()
    }

    /// Backs `GET /stats/dashboard` (§6).
    pub async fn dashboard_stats(&self) -> AppResult<DashboardStats> {
        let totals = sqlx::query(
            r#"SELECT
                (SELECT COUNT(*) FROM observations) AS total_observations,
                (SELECT COUNT(*) FROM analyses) AS total_analyses,
                (SELECT COUNT(*) FROM analyses WHERE effectiveness = 'PENDING') AS pending_count,
                (SELECT COUNT(*) FROM analyses WHERE effectiveness = 'CONFIRMED') AS confirmed_count,
                (SELECT COUNT(*) FROM analyses WHERE effectiveness = 'FAILED') AS failed_count"#,
        )
        .fetch_one(&self.pool)
        .await?;

        let since = (Utc::now() - chrono::Duration::days(7)).to_rfc3339();
        let histogram_rows = sqlx::query(
            r#"SELECT date(checked_at) AS day, COUNT(*) AS confirmed_count, AVG(gain_ratio) AS mean_gain_ratio
               FROM feedback_entries
               WHERE checked_at >= ? AND gain_ratio >= 0
               GROUP BY day ORDER BY day ASC"#,
        )
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;

        let confirmed_gain_histogram_7d = histogram_rows
            .iter()
            .map(|row| {
                let day: String = row.try_get("day")?;
                Ok(GainBucket {
                    day: day
                        .parse::<NaiveDate>()
                        .map_err(|e| AppError::Internal(e.to_string()))?,
                    confirmed_count: row.try_get("confirmed_count")?,
                    mean_gain_ratio: row.try_get("mean_gain_ratio")?,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(DashboardStats {
            total_observations: totals.try_get("total_observations")?,
            total_analyses: totals.try_get("total_analyses")?,
            pending_count: totals.try_get("pending_count")?,
            confirmed_count: totals.try_get("confirmed_count")?,
            failed_count: totals.try_get("failed_count")?,
            confirmed_gain_histogram_7d,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewAnalysis, NewObservation};
    use crate::store::test_store;

    #[tokio::test]
    async fn dashboard_stats_counts_totals() {
        let store = test_store().await;
        let (id, _) = store
            .insert_observation(NewObservation {
                source_type: SourceType::Mysql,
                source_host: "db1".into(),
                source_database: "app".into(),
                fingerprint: "fp".into(),
                full_sql: "select 1".into(),
                duration_ms: 500.0,
                rows_examined: None,
                rows_returned: None,
                captured_at: Utc::now(),
                plan: None,
                tenant_scope: "t".into(),
            })
            .await
            .unwrap();
        store.claim_new_observations(10).await.unwrap();
        store
            .finalize_analysis(
                id,
                NewAnalysis {
                    problem: "p".into(),
                    root_cause: "r".into(),
                    recommendations: vec![],
                    improvement_level: crate::models::ImprovementLevel::Low,
                    provider: "rules".into(),
                    model_version: "v1".into(),
                },
            )
            .await
            .unwrap();

        let stats = store.dashboard_stats().await.unwrap();
        assert_eq!(stats.total_observations, 1);
        assert_eq!(stats.total_analyses, 1);
        assert_eq!(stats.pending_count, 1);
    }

    async fn seed_analysis(
        store: &Store,
        fingerprint: &str,
        host: &str,
        captured_at: DateTime<Utc>,
        effectiveness: Effectiveness,
        gain_ratio: Option<f64>,
    ) -> i64 {
        let (id, _) = store
            .insert_observation(NewObservation {
                source_type: SourceType::Mysql,
                source_host: host.into(),
                source_database: "app".into(),
                fingerprint: fingerprint.into(),
                full_sql: "select 1".into(),
                duration_ms: 500.0,
                rows_examined: None,
                rows_returned: None,
                captured_at,
                plan: None,
                tenant_scope: "t".into(),
            })
            .await
            .unwrap();
        store.claim_new_observations(10).await.unwrap();
        let analysis_id = store
            .finalize_analysis(
                id,
                NewAnalysis {
                    problem: "p".into(),
                    root_cause: "r".into(),
                    recommendations: vec![],
                    improvement_level: crate::models::ImprovementLevel::Low,
                    provider: "rules".into(),
                    model_version: "v1".into(),
                },
            )
            .await
            .unwrap();
        if effectiveness != Effectiveness::Pending {
            store.set_analysis_effectiveness(analysis_id, effectiveness, gain_ratio).await.unwrap();
        }
        analysis_id
    }

    #[tokio::test]
    async fn best_effectiveness_prefers_confirmed_over_failed_and_pending() {
        let store = test_store().await;
        seed_analysis(&store, "fp-rank", "db1", Utc::now(), Effectiveness::Failed, None).await;
        seed_analysis(&store, "fp-rank", "db2", Utc::now(), Effectiveness::Pending, None).await;
        seed_analysis(&store, "fp-rank", "db3", Utc::now(), Effectiveness::Confirmed, Some(0.5)).await;

        let summaries = store.summarise_by_fingerprint(SlowQueryFilters { limit: 10, offset: 0, ..Default::default() })
            .await
            .unwrap();
        let row = summaries.iter().find(|s| s.fingerprint == "fp-rank").unwrap();
        assert_eq!(row.best_effectiveness, Some(Effectiveness::Confirmed));
    }

    #[tokio::test]
    async fn best_effectiveness_prefers_pending_over_failed() {
        let store = test_store().await;
        seed_analysis(&store, "fp-rank2", "db1", Utc::now(), Effectiveness::Failed, None).await;
        seed_analysis(&store, "fp-rank2", "db2", Utc::now(), Effectiveness::Pending, None).await;

        let summaries = store.summarise_by_fingerprint(SlowQueryFilters { limit: 10, offset: 0, ..Default::default() })
            .await
            .unwrap();
        let row = summaries.iter().find(|s| s.fingerprint == "fp-rank2").unwrap();
        assert_eq!(row.best_effectiveness, Some(Effectiveness::Pending));
    }
}
