use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;
use uuid::Uuid;

use crate::analytics::analytics_models::{EvaluationRecord, RecordBucket};
use crate::flags::flag_match_reason::EvaluationReason;
use crate::flags::flag_models::{
    Flag, FlagId, FlagUpdate, NewFlag, NewRule, Rule, RuleId, RuleType,
};
use crate::store::{EvaluationStore, FlagAdminStore, FlagCounts, FlagStore, StoreError};

const FLAG_COLUMNS: &str =
    "id, name, description, enabled, rollout_percentage, created_by, created_at, updated_at";
const RULE_COLUMNS: &str = "id, flag_id, rule_type, rule_value, enabled, priority, created_at";

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    enabled: bool,
    rollout_percentage: i32,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FlagRow {
    fn into_flag(self, rules: Vec<Rule>) -> Flag {
        Flag {
            id: self.id,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            rollout_percentage: self.rollout_percentage,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            rules,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    flag_id: Uuid,
    rule_type: String,
    rule_value: String,
    enabled: bool,
    priority: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let rule_type = RuleType::from_str(&row.rule_type).map_err(|_| {
            StoreError::DataParsing(format!("unknown rule type {}", row.rule_type))
        })?;
        Ok(Rule {
            id: row.id,
            flag_id: row.flag_id,
            rule_type,
            value: row.rule_value,
            enabled: row.enabled,
            priority: row.priority,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BucketRow {
    hour: DateTime<Utc>,
    result: bool,
    evaluation_reason: String,
    count: i64,
}

impl TryFrom<BucketRow> for RecordBucket {
    type Error = StoreError;

    fn try_from(row: BucketRow) -> Result<Self, Self::Error> {
        let reason = EvaluationReason::from_str(&row.evaluation_reason).map_err(|_| {
            StoreError::DataParsing(format!(
                "unknown evaluation reason {}",
                row.evaluation_reason
            ))
        })?;
        Ok(RecordBucket {
            hour: row.hour,
            result: row.result,
            reason,
            count: row.count,
        })
    }
}

/// PostgreSQL-backed system of record.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Builds a lazily connecting pool; nothing touches the network until the first query.
    pub fn new(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))
    }

    async fn rules_for(&self, flag_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Rule>>, StoreError> {
        if flag_ids.is_empty() {
            return Ok(HashMap::new());
        }
        // created_at, id reproduces insertion order; ids are time-ordered v7 uuids
        let query = format!(
            "SELECT {RULE_COLUMNS} FROM flag_rules WHERE flag_id = ANY($1) ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, RuleRow>(&query)
            .bind(flag_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut by_flag: HashMap<Uuid, Vec<Rule>> = HashMap::new();
        for row in rows {
            let rule = Rule::try_from(row)?;
            by_flag.entry(rule.flag_id).or_default().push(rule);
        }
        Ok(by_flag)
    }

    async fn with_rules(&self, row: Option<FlagRow>) -> Result<Option<Flag>, StoreError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut rules = self.rules_for(&[row.id]).await?;
        let flag_rules = rules.remove(&row.id).unwrap_or_default();
        Ok(Some(row.into_flag(flag_rules)))
    }
}

#[async_trait]
impl FlagStore for PgStore {
    #[instrument(skip_all)]
    async fn load_enabled_flags_with_rules(&self) -> Result<Vec<Flag>, StoreError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE enabled = true");
        let rows = sqlx::query_as::<_, FlagRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut rules = self.rules_for(&ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let flag_rules = rules.remove(&row.id).unwrap_or_default();
                row.into_flag(flag_rules)
            })
            .collect())
    }

    #[instrument(skip_all, fields(name = %name))]
    async fn load_flag_by_name(&self, name: &str) -> Result<Option<Flag>, StoreError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE name = $1");
        let row = sqlx::query_as::<_, FlagRow>(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        self.with_rules(row).await
    }

    #[instrument(skip_all, fields(flag_id = %id))]
    async fn load_flag_by_id(&self, id: FlagId) -> Result<Option<Flag>, StoreError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE id = $1");
        let row = sqlx::query_as::<_, FlagRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.with_rules(row).await
    }

    async fn count_flags(&self) -> Result<FlagCounts, StoreError> {
        let (total, enabled): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE enabled) FROM feature_flags",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(FlagCounts { total, enabled })
    }
}

#[async_trait]
impl FlagAdminStore for PgStore {
    #[instrument(skip_all)]
    async fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags ORDER BY created_at DESC");
        let rows = sqlx::query_as::<_, FlagRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.into_flag(vec![])).collect())
    }

    #[instrument(skip_all, fields(name = %flag.name))]
    async fn insert_flag(&self, flag: NewFlag) -> Result<Flag, StoreError> {
        let query = format!(
            r#"
INSERT INTO feature_flags
    (id, name, description, enabled, rollout_percentage, created_by, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, NOW(), NOW())
RETURNING {FLAG_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FlagRow>(&query)
            .bind(Uuid::now_v7())
            .bind(&flag.name)
            .bind(&flag.description)
            .bind(flag.enabled)
            .bind(flag.rollout_percentage)
            .bind(&flag.created_by)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into_flag(vec![]))
    }

    #[instrument(skip_all, fields(flag_id = %id))]
    async fn update_flag(
        &self,
        id: FlagId,
        update: FlagUpdate,
    ) -> Result<Option<Flag>, StoreError> {
        let query = format!(
            r#"
UPDATE feature_flags
SET
    description = COALESCE($2, description),
    enabled = COALESCE($3, enabled),
    rollout_percentage = COALESCE($4, rollout_percentage),
    updated_at = NOW()
WHERE id = $1
RETURNING {FLAG_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FlagRow>(&query)
            .bind(id)
            .bind(&update.description)
            .bind(update.enabled)
            .bind(update.rollout_percentage)
            .fetch_optional(&self.pool)
            .await?;
        self.with_rules(row).await
    }

    #[instrument(skip_all, fields(flag_id = %id))]
    async fn delete_flag(&self, id: FlagId) -> Result<bool, StoreError> {
        // flag_rules and flag_evaluations cascade through their foreign keys
        let result = sqlx::query("DELETE FROM feature_flags WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(flag_id = %flag_id))]
    async fn insert_rule(&self, flag_id: FlagId, rule: NewRule) -> Result<Rule, StoreError> {
        let query = format!(
            r#"
INSERT INTO flag_rules
    (id, flag_id, rule_type, rule_value, enabled, priority, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, NOW())
RETURNING {RULE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, RuleRow>(&query)
            .bind(Uuid::now_v7())
            .bind(flag_id)
            .bind(rule.rule_type.to_string())
            .bind(&rule.value)
            .bind(rule.enabled)
            .bind(rule.priority)
            .fetch_one(&self.pool)
            .await?;
        Rule::try_from(row)
    }

    #[instrument(skip_all, fields(flag_id = %flag_id))]
    async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError> {
        let query = format!(
            "SELECT {RULE_COLUMNS} FROM flag_rules WHERE flag_id = $1 ORDER BY priority DESC, created_at, id"
        );
        let rows = sqlx::query_as::<_, RuleRow>(&query)
            .bind(flag_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Rule::try_from).collect()
    }

    #[instrument(skip_all, fields(rule_id = %rule_id))]
    async fn set_rule_enabled(&self, rule_id: RuleId, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE flag_rules SET enabled = $2 WHERE id = $1")
            .bind(rule_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(rule_id = %rule_id))]
    async fn delete_rule(&self, rule_id: RuleId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM flag_rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EvaluationStore for PgStore {
    async fn append_evaluation_record(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO flag_evaluations
    (id, flag_id, user_id, result, matched_rule_id, evaluation_reason, evaluated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(record.flag_id)
        .bind(&record.subject_id)
        .bind(record.result)
        .bind(record.matched_rule_id)
        .bind(record.reason.to_string())
        .bind(record.evaluated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(flag_id = %flag_id))]
    async fn query_records_since(
        &self,
        flag_id: FlagId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RecordBucket>, StoreError> {
        let rows = sqlx::query_as::<_, BucketRow>(
            r#"
SELECT
    date_trunc('hour', evaluated_at) AS hour,
    result,
    evaluation_reason,
    COUNT(*) AS count
FROM flag_evaluations
WHERE flag_id = $1 AND evaluated_at >= $2
GROUP BY 1, 2, 3
ORDER BY 1
            "#,
        )
        .bind(flag_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecordBucket::try_from).collect()
    }

    #[instrument(skip_all)]
    async fn delete_records_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM flag_evaluations WHERE evaluated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
