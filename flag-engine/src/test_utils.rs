use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::analytics::aggregator::bucket_records;
use crate::analytics::analytics_models::{EvaluationRecord, RecordBucket};
use crate::config::{Config, DEFAULT_TEST_CONFIG};
use crate::flags::flag_models::{
    Flag, FlagId, FlagUpdate, NewFlag, NewRule, Rule, RuleId, RuleType,
};
use crate::store::postgres::PgStore;
use crate::store::{EvaluationStore, FlagAdminStore, FlagCounts, FlagStore, StoreError};

pub fn random_string(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

/// Connects to the test database and brings its schema up to date.
pub async fn setup_pg_store(config: Option<&Config>) -> Arc<PgStore> {
    let config = config.unwrap_or(&DEFAULT_TEST_CONFIG);
    let store = PgStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.acquire_timeout(),
    )
    .expect("Failed to create Postgres pool");
    store
        .run_migrations()
        .await
        .expect("Failed to migrate the test database");
    Arc::new(store)
}

/// A flag with no rules, ready to be seeded into a store or evaluated directly.
pub fn test_flag(name: &str, enabled: bool, rollout_percentage: i32) -> Flag {
    let now = Utc::now();
    Flag {
        id: Uuid::now_v7(),
        name: name.to_string(),
        description: None,
        enabled,
        rollout_percentage,
        created_by: Some("tests".to_string()),
        created_at: now,
        updated_at: now,
        rules: vec![],
    }
}

pub fn test_rule(flag: &Flag, rule_type: RuleType, value: &str, priority: i32) -> Rule {
    Rule {
        id: Uuid::now_v7(),
        flag_id: flag.id,
        rule_type,
        value: value.to_string(),
        enabled: true,
        priority,
        created_at: Utc::now(),
    }
}

pub fn test_record(flag_id: FlagId, result: bool, evaluated_at: DateTime<Utc>) -> EvaluationRecord {
    use crate::flags::flag_match_reason::EvaluationReason;

    EvaluationRecord {
        flag_id,
        subject_id: random_string("user_"),
        result,
        reason: if result {
            EvaluationReason::RolloutIncluded
        } else {
            EvaluationReason::RolloutExcluded
        },
        matched_rule_id: None,
        evaluated_at,
    }
}

#[derive(Default)]
struct MemoryState {
    flags: Vec<Flag>,
    records: Vec<EvaluationRecord>,
}

/// In-memory system of record with failure injection, used by unit and integration tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    load_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    /// Stores a fully built flag, rules included, bypassing every check.
    pub fn seed_flag(&self, flag: Flag) {
        self.state().flags.push(flag);
    }

    pub fn seed_record(&self, record: EvaluationRecord) {
        self.state().records.push(record);
    }

    pub fn records(&self) -> Vec<EvaluationRecord> {
        self.state().records.clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every `load_enabled_flags_with_rules` call sleep before answering.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// How many times the enabled working set has been loaded.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Mutates a stored flag in place, the way an out-of-band write to the database would.
    pub fn modify_flag(&self, name: &str, change: impl FnOnce(&mut Flag)) {
        if let Some(flag) = self.state().flags.iter_mut().find(|flag| flag.name == name) {
            change(flag);
        }
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn load_enabled_flags_with_rules(&self) -> Result<Vec<Flag>, StoreError> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        // read first, then stall: a slow query answers with the data as of its start
        let flags: Vec<Flag> = self
            .state()
            .flags
            .iter()
            .filter(|flag| flag.enabled)
            .cloned()
            .collect();

        let delay = *self.load_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reads()?;
        Ok(flags)
    }

    async fn load_flag_by_name(&self, name: &str) -> Result<Option<Flag>, StoreError> {
        self.check_reads()?;
        Ok(self
            .state()
            .flags
            .iter()
            .find(|flag| flag.name == name)
            .cloned())
    }

    async fn load_flag_by_id(&self, id: FlagId) -> Result<Option<Flag>, StoreError> {
        self.check_reads()?;
        Ok(self.state().flags.iter().find(|flag| flag.id == id).cloned())
    }

    async fn count_flags(&self) -> Result<FlagCounts, StoreError> {
        self.check_reads()?;
        let state = self.state();
        Ok(FlagCounts {
            total: state.flags.len() as i64,
            enabled: state.flags.iter().filter(|flag| flag.enabled).count() as i64,
        })
    }
}

#[async_trait]
impl FlagAdminStore for MemoryStore {
    async fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        self.check_reads()?;
        Ok(self
            .state()
            .flags
            .iter()
            .rev()
            .map(|flag| Flag {
                rules: vec![],
                ..flag.clone()
            })
            .collect())
    }

    async fn insert_flag(&self, new_flag: NewFlag) -> Result<Flag, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        if state.flags.iter().any(|flag| flag.name == new_flag.name) {
            return Err(StoreError::UniqueViolation(
                "feature_flags_name_key".to_string(),
            ));
        }

        let now = Utc::now();
        let flag = Flag {
            id: Uuid::now_v7(),
            name: new_flag.name,
            description: new_flag.description,
            enabled: new_flag.enabled,
            rollout_percentage: new_flag.rollout_percentage,
            created_by: new_flag.created_by,
            created_at: now,
            updated_at: now,
            rules: vec![],
        };
        state.flags.push(flag.clone());
        Ok(flag)
    }

    async fn update_flag(
        &self,
        id: FlagId,
        update: FlagUpdate,
    ) -> Result<Option<Flag>, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        let Some(flag) = state.flags.iter_mut().find(|flag| flag.id == id) else {
            return Ok(None);
        };

        if let Some(description) = update.description {
            flag.description = Some(description);
        }
        if let Some(enabled) = update.enabled {
            flag.enabled = enabled;
        }
        if let Some(rollout_percentage) = update.rollout_percentage {
            flag.rollout_percentage = rollout_percentage;
        }
        flag.updated_at = Utc::now();
        Ok(Some(flag.clone()))
    }

    async fn delete_flag(&self, id: FlagId) -> Result<bool, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        let before = state.flags.len();
        state.flags.retain(|flag| flag.id != id);
        state.records.retain(|record| record.flag_id != id);
        Ok(state.flags.len() < before)
    }

    async fn insert_rule(&self, flag_id: FlagId, new_rule: NewRule) -> Result<Rule, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        let Some(flag) = state.flags.iter_mut().find(|flag| flag.id == flag_id) else {
            return Err(StoreError::DataParsing(format!("no flag with id {flag_id}")));
        };
        if flag.find_rule(new_rule.rule_type, &new_rule.value).is_some() {
            return Err(StoreError::UniqueViolation(
                "flag_rules_flag_id_rule_type_rule_value_key".to_string(),
            ));
        }

        let rule = Rule {
            id: Uuid::now_v7(),
            flag_id,
            rule_type: new_rule.rule_type,
            value: new_rule.value,
            enabled: new_rule.enabled,
            priority: new_rule.priority,
            created_at: Utc::now(),
        };
        flag.rules.push(rule.clone());
        Ok(rule)
    }

    async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError> {
        self.check_reads()?;
        let mut rules = self
            .state()
            .flags
            .iter()
            .find(|flag| flag.id == flag_id)
            .map(|flag| flag.rules.clone())
            .unwrap_or_default();
        rules.sort_by_key(|rule| Reverse(rule.priority));
        Ok(rules)
    }

    async fn set_rule_enabled(&self, rule_id: RuleId, enabled: bool) -> Result<bool, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        let rule = state
            .flags
            .iter_mut()
            .flat_map(|flag| flag.rules.iter_mut())
            .find(|rule| rule.id == rule_id);
        match rule {
            Some(rule) => {
                rule.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rule(&self, rule_id: RuleId) -> Result<bool, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        for flag in state.flags.iter_mut() {
            let before = flag.rules.len();
            flag.rules.retain(|rule| rule.id != rule_id);
            if flag.rules.len() < before {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn append_evaluation_record(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        self.check_writes()?;
        self.state().records.push(record.clone());
        Ok(())
    }

    async fn query_records_since(
        &self,
        flag_id: FlagId,
        since: DateTime<Utc>,
    ) -> Result<Vec<RecordBucket>, StoreError> {
        self.check_reads()?;
        let state = self.state();
        let records: Vec<EvaluationRecord> = state
            .records
            .iter()
            .filter(|record| record.flag_id == flag_id && record.evaluated_at >= since)
            .cloned()
            .collect();
        Ok(bucket_records(&records))
    }

    async fn delete_records_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_writes()?;
        let mut state = self.state();
        let before = state.records.len();
        state.records.retain(|record| record.evaluated_at >= cutoff);
        Ok((before - state.records.len()) as u64)
    }
}
