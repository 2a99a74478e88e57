use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::flag_match_reason::EvaluationReason;
use crate::flags::flag_models::{FlagId, RuleId};

/// One persisted evaluation. Append-only: written once, removed only by the retention
/// sweep or when its flag is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub flag_id: FlagId,
    pub subject_id: String,
    pub result: bool,
    pub reason: EvaluationReason,
    pub matched_rule_id: Option<RuleId>,
    pub evaluated_at: DateTime<Utc>,
}

/// Count of records sharing an hour, a result and a reason. This is the shape the store
/// hands back for aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBucket {
    pub hour: DateTime<Utc>,
    pub result: bool,
    pub reason: EvaluationReason,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub enabled_count: i64,
    pub disabled_count: i64,
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub flag_id: FlagId,
    pub flag_name: String,
    pub window_hours: u32,
    pub total_evaluations: i64,
    pub enabled_count: i64,
    pub disabled_count: i64,
    pub enabled_percentage: f64,
    pub configured_rollout_percentage: i32,
    pub evaluations_by_reason: BTreeMap<String, i64>,
    pub evaluations_over_time: Vec<TimeSeriesPoint>,
}
