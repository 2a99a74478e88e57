//! Interfaces to the system of record.
//!
//! The engine only ever talks to persistence through these traits: the cache reads through
//! [`FlagStore`], the admin path writes through [`FlagAdminStore`], and the recorder and
//! analytics go through [`EvaluationStore`]. [`postgres::PgStore`] implements all three.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::analytics::analytics_models::{EvaluationRecord, RecordBucket};
use crate::flags::flag_models::{Flag, FlagId, FlagUpdate, NewFlag, NewRule, Rule, RuleId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to parse stored data: {0}")]
    DataParsing(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(ref db_error) if db_error.is_unique_violation() => {
                StoreError::UniqueViolation(
                    db_error
                        .constraint()
                        .unwrap_or("unknown constraint")
                        .to_string(),
                )
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(error.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

/// Flag totals reported by the readiness check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagCounts {
    pub total: i64,
    pub enabled: i64,
}

/// Read side used by the cache and analytics.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Every enabled flag, each with all of its rules in insertion order.
    async fn load_enabled_flags_with_rules(&self) -> Result<Vec<Flag>, StoreError>;

    async fn load_flag_by_name(&self, name: &str) -> Result<Option<Flag>, StoreError>;

    async fn load_flag_by_id(&self, id: FlagId) -> Result<Option<Flag>, StoreError>;

    /// Flag totals; readiness also relies on this call to confirm the store is reachable.
    async fn count_flags(&self) -> Result<FlagCounts, StoreError>;
}

/// Administrative writes. Callers are responsible for invalidating the flag cache.
#[async_trait]
pub trait FlagAdminStore: FlagStore {
    /// All flags, newest first, without their rules.
    async fn list_flags(&self) -> Result<Vec<Flag>, StoreError>;

    async fn insert_flag(&self, flag: NewFlag) -> Result<Flag, StoreError>;

    async fn update_flag(&self, id: FlagId, update: FlagUpdate)
        -> Result<Option<Flag>, StoreError>;

    /// Deletes the flag together with its rules and evaluation records.
    async fn delete_flag(&self, id: FlagId) -> Result<bool, StoreError>;

    async fn insert_rule(&self, flag_id: FlagId, rule: NewRule) -> Result<Rule, StoreError>;

    /// Rules of a flag, highest priority first.
    async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError>;

    async fn set_rule_enabled(&self, rule_id: RuleId, enabled: bool) -> Result<bool, StoreError>;

    async fn delete_rule(&self, rule_id: RuleId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn append_evaluation_record(&self, record: &EvaluationRecord) -> Result<(), StoreError>;

    /// Records of a flag evaluated at or after `since`, grouped by hour, result and reason.
    async fn query_records_since(
        &self,
        flag_id: FlagId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RecordBucket>, StoreError>;

    /// Deletes records strictly older than `cutoff`, returning how many went.
    async fn delete_records_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
