use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::instrument;

use crate::analytics::aggregator::AnalyticsAggregator;
use crate::analytics::analytics_models::AnalyticsSummary;
use crate::api::errors::FlagError;
use crate::flags::flag_cache::FlagCache;
use crate::flags::flag_matching::{evaluate_flag, EvaluationOutcome};
use crate::flags::flag_models::{CallerContext, FlagId};
use crate::metrics_consts::{FLAG_EVALUATIONS_COUNTER, FLAG_EVALUATION_TIME};
use crate::metrics_utils::{histogram, inc};
use crate::recorder::EvaluationRecorder;

/// Entry point for evaluation: reads the cached working set, evaluates, hands every
/// outcome of a known flag to the recorder.
pub struct FlagEvaluationService {
    cache: Arc<FlagCache>,
    recorder: EvaluationRecorder,
    analytics: AnalyticsAggregator,
}

impl FlagEvaluationService {
    pub fn new(
        cache: Arc<FlagCache>,
        recorder: EvaluationRecorder,
        analytics: AnalyticsAggregator,
    ) -> Self {
        Self {
            cache,
            recorder,
            analytics,
        }
    }

    fn check_context(ctx: &CallerContext) -> Result<(), FlagError> {
        if ctx.subject_id.trim().is_empty() {
            return Err(FlagError::MissingSubjectId);
        }
        Ok(())
    }

    fn count_outcome(outcome: &EvaluationOutcome) {
        inc(
            FLAG_EVALUATIONS_COUNTER,
            &[("reason".to_string(), outcome.reason.to_string())],
            1,
        );
    }

    /// Evaluates every enabled flag for the caller, keyed by flag name.
    #[instrument(skip_all, fields(subject_id = %ctx.subject_id))]
    pub async fn evaluate_all(
        &self,
        ctx: &CallerContext,
    ) -> Result<HashMap<String, EvaluationOutcome>, FlagError> {
        Self::check_context(ctx)?;
        let start = Instant::now();
        let flags = self.cache.get_enabled_flags().await?;

        let mut outcomes = HashMap::with_capacity(flags.len());
        for flag in flags.iter() {
            let outcome = evaluate_flag(flag, ctx);
            Self::count_outcome(&outcome);
            self.recorder.record(flag, &ctx.subject_id, &outcome);
            outcomes.insert(flag.name.clone(), outcome);
        }

        histogram(
            FLAG_EVALUATION_TIME,
            &[],
            start.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(outcomes)
    }

    /// Evaluates one flag by name. A name outside the working set is off, not an error,
    /// and leaves no record since there is no flag to attach it to.
    #[instrument(skip_all, fields(flag = %name, subject_id = %ctx.subject_id))]
    pub async fn evaluate_one(
        &self,
        name: &str,
        ctx: &CallerContext,
    ) -> Result<EvaluationOutcome, FlagError> {
        Self::check_context(ctx)?;
        let Some(flag) = self.cache.get_flag_by_name(name).await? else {
            let outcome = EvaluationOutcome::unknown_flag(name);
            Self::count_outcome(&outcome);
            return Ok(outcome);
        };

        let outcome = evaluate_flag(&flag, ctx);
        Self::count_outcome(&outcome);
        self.recorder.record(&flag, &ctx.subject_id, &outcome);
        Ok(outcome)
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    pub async fn get_analytics(
        &self,
        flag_id: FlagId,
        window_hours: u32,
    ) -> Result<AnalyticsSummary, FlagError> {
        self.analytics.get_analytics(flag_id, window_hours).await
    }
}
