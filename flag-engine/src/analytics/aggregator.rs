use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::instrument;

use crate::analytics::analytics_models::{
    AnalyticsSummary, EvaluationRecord, RecordBucket, TimeSeriesPoint,
};
use crate::api::errors::FlagError;
use crate::flags::flag_models::{Flag, FlagId};
use crate::metrics_consts::ANALYTICS_QUERY_TIME;
use crate::metrics_utils::histogram;
use crate::store::{EvaluationStore, FlagStore};

pub fn truncate_to_hour(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .duration_trunc(Duration::hours(1))
        .unwrap_or(timestamp)
}

/// Groups raw records by (hour, result, reason), ordered by hour ascending.
pub fn bucket_records(records: &[EvaluationRecord]) -> Vec<RecordBucket> {
    let mut counts: BTreeMap<(DateTime<Utc>, bool, _), i64> = BTreeMap::new();
    for record in records {
        *counts
            .entry((
                truncate_to_hour(record.evaluated_at),
                record.result,
                record.reason,
            ))
            .or_default() += 1;
    }

    counts
        .into_iter()
        .map(|((hour, result, reason), count)| RecordBucket {
            hour,
            result,
            reason,
            count,
        })
        .collect()
}

/// Percentage of `part` in `total` rounded to two decimals, 0.0 for an empty total.
fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
}

/// Folds bucketed counts into a summary. Hours without records do not appear in the series.
pub fn summarize(flag: &Flag, window_hours: u32, buckets: &[RecordBucket]) -> AnalyticsSummary {
    let mut enabled_count = 0;
    let mut disabled_count = 0;
    let mut by_reason: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_hour: BTreeMap<DateTime<Utc>, (i64, i64)> = BTreeMap::new();

    for bucket in buckets {
        let hour = by_hour.entry(truncate_to_hour(bucket.hour)).or_default();
        if bucket.result {
            enabled_count += bucket.count;
            hour.0 += bucket.count;
        } else {
            disabled_count += bucket.count;
            hour.1 += bucket.count;
        }
        *by_reason.entry(bucket.reason.to_string()).or_default() += bucket.count;
    }

    let total_evaluations = enabled_count + disabled_count;
    AnalyticsSummary {
        flag_id: flag.id,
        flag_name: flag.name.clone(),
        window_hours,
        total_evaluations,
        enabled_count,
        disabled_count,
        enabled_percentage: percentage(enabled_count, total_evaluations),
        configured_rollout_percentage: flag.rollout_percentage,
        evaluations_by_reason: by_reason,
        evaluations_over_time: by_hour
            .into_iter()
            .filter(|(_, (enabled, disabled))| enabled + disabled > 0)
            .map(|(timestamp, (enabled, disabled))| TimeSeriesPoint {
                timestamp,
                enabled_count: enabled,
                disabled_count: disabled,
                total_count: enabled + disabled,
            })
            .collect(),
    }
}

/// Longest analytics window served, one year.
pub const MAX_WINDOW_HOURS: u32 = 24 * 366;

/// Read-time statistics over recorded evaluations.
#[derive(Clone)]
pub struct AnalyticsAggregator {
    flags: Arc<dyn FlagStore>,
    evaluations: Arc<dyn EvaluationStore>,
}

impl AnalyticsAggregator {
    pub fn new(flags: Arc<dyn FlagStore>, evaluations: Arc<dyn EvaluationStore>) -> Self {
        Self { flags, evaluations }
    }

    /// Summary of the last `window_hours` of evaluations. Unknown flag ids are an error.
    #[instrument(skip(self))]
    pub async fn get_analytics(
        &self,
        flag_id: FlagId,
        window_hours: u32,
    ) -> Result<AnalyticsSummary, FlagError> {
        if window_hours == 0 || window_hours > MAX_WINDOW_HOURS {
            return Err(FlagError::InvalidAnalyticsWindow(i64::from(window_hours)));
        }
        let start = Instant::now();

        let flag = self
            .flags
            .load_flag_by_id(flag_id)
            .await?
            .ok_or_else(|| FlagError::FlagNotFound(flag_id.to_string()))?;

        let since = Utc::now() - Duration::hours(i64::from(window_hours));
        let buckets = self.evaluations.query_records_since(flag_id, since).await?;
        let summary = summarize(&flag, window_hours, &buckets);

        histogram(
            ANALYTICS_QUERY_TIME,
            &[],
            start.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(summary)
    }

    /// Deletes every record strictly older than `cutoff`.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, FlagError> {
        Ok(self.evaluations.delete_records_older_than(cutoff).await?)
    }
}
