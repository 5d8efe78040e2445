//! Learning Evaluator (§4.6): the feedback loop that turns a PENDING
//! analysis into CONFIRMED or FAILED by comparing the baseline duration
//! against durations observed after the grace window. Orchestration shape
//! (drain a bounded batch, process independently, isolate per-item
//! failures) mirrors the Analyzer; grounded the same way on the
//! Scheduler's own tick pattern.

use chrono::Duration as ChronoDuration;

use crate::config::LearningConfig;
use crate::models::{Effectiveness, NewFeedbackEntry};
use crate::store::Store;
use crate::utils::AppResult;

pub struct LearningEvaluator {
    store: Store,
    config: LearningConfig,
}

impl LearningEvaluator {
    pub fn new(store: Store, config: LearningConfig) -> Self {
        Self { store, config }
    }

    /// Runs one evaluation pass: auto-fails stale PENDING analyses, then
    /// classifies every PENDING analysis old enough to have a post-window.
    /// Returns (confirmed, failed, left_pending) counts.
    pub async fn run_once(&self, batch_limit: i64) -> AppResult<(usize, usize, usize)> {
        let stale = self
            .store
            .terminalize_stale_pending(ChronoDuration::days(self.config.max_pending_age_days))
            .await?;
        if stale > 0 {
            tracing::info!(count = stale, "auto-failed stale pending analyses");
        }

        let pending = self
            .store
            .pending_analyses(ChronoDuration::seconds(self.config.pending_min_age_secs as i64), batch_limit)
            .await?;

        let mut confirmed = 0;
        let mut failed = 0;
        let mut left_pending = 0;

        for analysis in pending {
            match self.evaluate_one(analysis.id, analysis.observation_id).await {
                Ok(Some(Effectiveness::Confirmed)) => confirmed += 1,
                Ok(Some(Effectiveness::Failed)) => failed += 1,
                Ok(Some(Effectiveness::Pending)) | Ok(None) => left_pending += 1,
                Err(e) => {
                    tracing::warn!(analysis_id = analysis.id, error = %e, "learning evaluation failed for analysis");
                    left_pending += 1;
                },
            }
        }

        Ok((confirmed, failed, left_pending))
    }

    /// Classifies a single PENDING analysis. Returns `Ok(None)` when there
    /// isn't yet enough post-window data to decide (still PENDING).
    async fn evaluate_one(&self, analysis_id: i64, observation_id: i64) -> AppResult<Option<Effectiveness>> {
        let Some(baseline) = self.store.get_observation(observation_id).await? else {
            // Observation was purged or never existed; nothing to learn from.
            self.store.set_analysis_effectiveness(analysis_id, Effectiveness::Failed, None).await?;
            return Ok(Some(Effectiveness::Failed));
        };

        if baseline.duration_ms < self.config.min_baseline_ms {
            // Too fast to begin with for a meaningful gain ratio: skip this
            // pass rather than silently classifying measurement jitter as a
            // verdict either way. Bounded by the stale-pending auto-fail.
            return Ok(None);
        }

        let after = baseline.captured_at + ChronoDuration::seconds(self.config.grace_secs as i64);
        let samples = self
            .store
            .post_observations(&baseline.fingerprint, after, self.config.sample_size as i64)
            .await?;

        if samples.len() < self.config.min_samples as usize {
            return Ok(None);
        }

        let mean_new_duration = samples.iter().map(|o| o.duration_ms).sum::<f64>() / samples.len() as f64;
        let gain_ratio = (baseline.duration_ms - mean_new_duration) / baseline.duration_ms;

        let effectiveness = if gain_ratio < 0.0 {
            Effectiveness::Failed
        } else if gain_ratio < self.config.improvement_threshold {
            // Ambiguous zone: neither a regression nor a confirmed win yet.
            // Leave PENDING and record no feedback to avoid premature
            // classification churn; a later, larger post-window may clear
            // the threshold.
            return Ok(None);
        } else {
            Effectiveness::Confirmed
        };

        let changed = self
            .store
            .set_analysis_effectiveness(analysis_id, effectiveness, Some(gain_ratio))
            .await?;
        if !changed {
            // Another evaluator pass (or the stale-pending sweep) already
            // terminalised this analysis; nothing left to do.
            return Ok(None);
        }

        self.store
            .record_feedback(NewFeedbackEntry {
                fingerprint: baseline.fingerprint.clone(),
                analysis_id,
                old_duration_ms: baseline.duration_ms,
                new_duration_ms: mean_new_duration,
                gain_ratio,
                checked_at: chrono::Utc::now(),
            })
            .await?;

        Ok(Some(effectiveness))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImprovementLevel, NewAnalysis, NewObservation, SourceType};
    use chrono::Utc;

    async fn seed(store: &Store, duration_ms: f64, captured_at: chrono::DateTime<Utc>) -> (i64, i64) {
        let obs = NewObservation {
            source_type: SourceType::Mysql,
            source_host: "db1".into(),
            source_database: "app".into(),
            fingerprint: "fp-learn".into(),
            full_sql: "select 1".into(),
            duration_ms,
            rows_examined: None,
            rows_returned: None,
            captured_at,
            plan: None,
            tenant_scope: "t".into(),
        };
        let (observation_id, _) = store.insert_observation(obs).await.unwrap();
        store.claim_new_observations(10).await.unwrap();
        let analysis_id = store
            .finalize_analysis(
                observation_id,
                NewAnalysis {
                    problem: "p".into(),
                    root_cause: "r".into(),
                    recommendations: vec![],
                    improvement_level: ImprovementLevel::Medium,
                    provider: "rules".into(),
                    model_version: "v1".into(),
                },
            )
            .await
            .unwrap();
        (observation_id, analysis_id)
    }

    fn fast_config() -> LearningConfig {
        LearningConfig {
            improvement_threshold: 0.3,
            min_samples: 2,
            sample_size: 5,
            grace_secs: 0,
            max_pending_age_days: 30,
            min_baseline_ms: 10.0,
            pending_min_age_secs: 0,
            feedback_idempotency_secs: 86_400,
        }
    }

    #[tokio::test]
    async fn confirms_when_gain_ratio_clears_threshold() {
        let store = crate::store::test_store().await;
        let baseline_time = Utc::now() - ChronoDuration::minutes(10);
        let (_, analysis_id) = seed(&store, 1000.0, baseline_time).await;

        for i in 0..3 {
            store
                .insert_observation(NewObservation {
                    source_type: SourceType::Mysql,
                    source_host: "db1".into(),
                    source_database: "app".into(),
                    fingerprint: "fp-learn".into(),
                    full_sql: "select 1".into(),
                    duration_ms: 100.0,
                    rows_examined: None,
                    rows_returned: None,
                    captured_at: baseline_time + ChronoDuration::minutes(1 + i),
                    plan: None,
                    tenant_scope: "t".into(),
                })
                .await
                .unwrap();
        }

        let evaluator = LearningEvaluator::new(store.clone(), fast_config());
        let (confirmed, failed, pending) = evaluator.run_once(10).await.unwrap();
        assert_eq!(confirmed, 1);
        assert_eq!(failed, 0);
        assert_eq!(pending, 0);

        let analysis = store.get_analysis(analysis_id).await.unwrap().unwrap();
        assert_eq!(analysis.effectiveness, Effectiveness::Confirmed);
        assert!(analysis.gain_ratio.unwrap() > 0.3);
    }

    #[tokio::test]
    async fn stays_pending_without_enough_samples() {
        let store = crate::store::test_store().await;
        let baseline_time = Utc::now() - ChronoDuration::minutes(10);
        seed(&store, 1000.0, baseline_time).await;

        let evaluator = LearningEvaluator::new(store.clone(), fast_config());
        let (confirmed, failed, pending) = evaluator.run_once(10).await.unwrap();
        assert_eq!(confirmed, 0);
        assert_eq!(failed, 0);
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn skips_below_baseline_floor() {
        let store = crate::store::test_store().await;
        let baseline_time = Utc::now() - ChronoDuration::minutes(10);
        let (_, analysis_id) = seed(&store, 2.0, baseline_time).await;

        let evaluator = LearningEvaluator::new(store.clone(), fast_config());
        let (confirmed, failed, pending) = evaluator.run_once(10).await.unwrap();
        assert_eq!(confirmed, 0);
        assert_eq!(failed, 0);
        assert_eq!(pending, 1);

        let analysis = store.get_analysis(analysis_id).await.unwrap().unwrap();
        assert_eq!(analysis.effectiveness, Effectiveness::Pending);
    }

    #[tokio::test]
    async fn stays_pending_in_ambiguous_gain_zone() {
        let store = crate::store::test_store().await;
        let baseline_time = Utc::now() - ChronoDuration::minutes(10);
        let (_, analysis_id) = seed(&store, 1000.0, baseline_time).await;

        // Mean new duration 900ms => gain_ratio 0.10, below the 0.3 threshold
        // but not a regression either.
        for i in 0..3 {
            store
                .insert_observation(NewObservation {
                    source_type: SourceType::Mysql,
                    source_host: "db1".into(),
                    source_database: "app".into(),
                    fingerprint: "fp-learn".into(),
                    full_sql: "select 1".into(),
                    duration_ms: 900.0,
                    rows_examined: None,
                    rows_returned: None,
                    captured_at: baseline_time + ChronoDuration::minutes(1 + i),
                    plan: None,
                    tenant_scope: "t".into(),
                })
                .await
                .unwrap();
        }

        let evaluator = LearningEvaluator::new(store.clone(), fast_config());
        let (confirmed, failed, pending) = evaluator.run_once(10).await.unwrap();
        assert_eq!(confirmed, 0);
        assert_eq!(failed, 0);
        assert_eq!(pending, 1);

        let analysis = store.get_analysis(analysis_id).await.unwrap().unwrap();
        assert_eq!(analysis.effectiveness, Effectiveness::Pending);
        assert!(analysis.gain_ratio.is_none());

        let history = store.feedback_timeline("fp-learn").await.unwrap();
        assert!(history.is_empty());
    }
}
