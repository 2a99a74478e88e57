use std::sync::Arc;

use tracing::{info, instrument};

use crate::api::errors::FlagError;
use crate::flags::flag_cache::FlagCache;
use crate::flags::flag_models::{Flag, FlagId, FlagUpdate, NewFlag, NewRule, Rule, RuleId};
use crate::store::{FlagAdminStore, StoreError};

const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

/// Lowercase ASCII letter first, then lowercase letters, digits and underscores.
pub fn validate_flag_name(name: &str) -> Result<(), FlagError> {
    if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
        return Err(FlagError::InvalidFlagName(format!(
            "must be between {MIN_NAME_LEN} and {MAX_NAME_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_valid = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !starts_with_letter || !rest_valid {
        return Err(FlagError::InvalidFlagName(
            "must start with a lowercase letter and contain only lowercase letters, numbers and underscores"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_rollout(rollout_percentage: i32) -> Result<(), FlagError> {
    if !(0..=100).contains(&rollout_percentage) {
        return Err(FlagError::InvalidRolloutPercentage(rollout_percentage));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<(), FlagError> {
    match description {
        Some(description) if description.chars().count() > MAX_DESCRIPTION_LEN => Err(
            FlagError::BadRequest(format!(
                "description cannot exceed {MAX_DESCRIPTION_LEN} characters"
            )),
        ),
        _ => Ok(()),
    }
}

/// Administrative writes. Every successful mutation invalidates the flag cache after the
/// write has landed, so the next evaluation sees it.
pub struct FlagAdminService {
    store: Arc<dyn FlagAdminStore>,
    cache: Arc<FlagCache>,
}

impl FlagAdminService {
    pub fn new(store: Arc<dyn FlagAdminStore>, cache: Arc<FlagCache>) -> Self {
        Self { store, cache }
    }

    async fn existing_flag(&self, id: FlagId) -> Result<Flag, FlagError> {
        self.store
            .load_flag_by_id(id)
            .await?
            .ok_or_else(|| FlagError::FlagNotFound(id.to_string()))
    }

    #[instrument(skip_all, fields(name = %new_flag.name))]
    pub async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, FlagError> {
        validate_flag_name(&new_flag.name)?;
        validate_rollout(new_flag.rollout_percentage)?;
        validate_description(new_flag.description.as_deref())?;

        if self.store.load_flag_by_name(&new_flag.name).await?.is_some() {
            return Err(FlagError::DuplicateFlag(new_flag.name));
        }

        let name = new_flag.name.clone();
        let flag = self.store.insert_flag(new_flag).await.map_err(|e| match e {
            // lost a race with a concurrent create of the same name
            StoreError::UniqueViolation(_) => FlagError::DuplicateFlag(name),
            other => other.into(),
        })?;
        self.cache.invalidate();

        info!(
            flag_id = %flag.id,
            created_by = flag.created_by.as_deref().unwrap_or("unknown"),
            "Created flag {}", flag.name
        );
        Ok(flag)
    }

    pub async fn get_flag(&self, id: FlagId) -> Result<Flag, FlagError> {
        self.existing_flag(id).await
    }

    pub async fn get_flag_by_name(&self, name: &str) -> Result<Flag, FlagError> {
        self.store
            .load_flag_by_name(name)
            .await?
            .ok_or_else(|| FlagError::FlagNotFound(name.to_string()))
    }

    /// Every flag, newest first, without rules.
    pub async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
        Ok(self.store.list_flags().await?)
    }

    #[instrument(skip_all, fields(flag_id = %id))]
    pub async fn update_flag(&self, id: FlagId, update: FlagUpdate) -> Result<Flag, FlagError> {
        if let Some(rollout_percentage) = update.rollout_percentage {
            validate_rollout(rollout_percentage)?;
        }
        validate_description(update.description.as_deref())?;

        let flag = self
            .store
            .update_flag(id, update)
            .await?
            .ok_or_else(|| FlagError::FlagNotFound(id.to_string()))?;
        self.cache.invalidate();

        info!(flag_id = %id, "Updated flag {}", flag.name);
        Ok(flag)
    }

    pub async fn toggle_flag(&self, id: FlagId, enabled: bool) -> Result<Flag, FlagError> {
        let update = FlagUpdate {
            enabled: Some(enabled),
            ..Default::default()
        };
        let flag = self
            .store
            .update_flag(id, update)
            .await?
            .ok_or_else(|| FlagError::FlagNotFound(id.to_string()))?;
        self.cache.invalidate();

        info!(flag_id = %id, enabled, "Toggled flag {}", flag.name);
        Ok(flag)
    }

    /// Deletes the flag, its rules and its evaluation history.
    #[instrument(skip_all, fields(flag_id = %id))]
    pub async fn delete_flag(&self, id: FlagId) -> Result<(), FlagError> {
        if !self.store.delete_flag(id).await? {
            return Err(FlagError::FlagNotFound(id.to_string()));
        }
        self.cache.invalidate();

        info!(flag_id = %id, "Deleted flag");
        Ok(())
    }

    #[instrument(skip_all, fields(flag_id = %flag_id))]
    pub async fn add_rule(&self, flag_id: FlagId, new_rule: NewRule) -> Result<Rule, FlagError> {
        if new_rule.value.trim().is_empty() {
            return Err(FlagError::BadRequest("rule value is required".to_string()));
        }

        let flag = self.existing_flag(flag_id).await?;
        if flag.find_rule(new_rule.rule_type, &new_rule.value).is_some() {
            return Err(FlagError::DuplicateRule {
                flag_id,
                rule_type: new_rule.rule_type,
                value: new_rule.value,
            });
        }

        let (rule_type, value) = (new_rule.rule_type, new_rule.value.clone());
        let rule = self
            .store
            .insert_rule(flag_id, new_rule)
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => FlagError::DuplicateRule {
                    flag_id,
                    rule_type,
                    value,
                },
                other => other.into(),
            })?;
        self.cache.invalidate();

        info!(
            flag_id = %flag_id,
            rule_id = %rule.id,
            "Added rule {} = {} to flag {}", rule.rule_type, rule.value, flag.name
        );
        Ok(rule)
    }

    /// Rules of a flag, highest priority first.
    pub async fn list_rules(&self, flag_id: FlagId) -> Result<Vec<Rule>, FlagError> {
        self.existing_flag(flag_id).await?;
        Ok(self.store.list_rules(flag_id).await?)
    }

    pub async fn toggle_rule(&self, rule_id: RuleId, enabled: bool) -> Result<(), FlagError> {
        if !self.store.set_rule_enabled(rule_id, enabled).await? {
            return Err(FlagError::RuleNotFound(rule_id));
        }
        self.cache.invalidate();

        info!(rule_id = %rule_id, enabled, "Toggled rule");
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: RuleId) -> Result<(), FlagError> {
        if !self.store.delete_rule(rule_id).await? {
            return Err(FlagError::RuleNotFound(rule_id));
        }
        self.cache.invalidate();

        info!(rule_id = %rule_id, "Deleted rule");
        Ok(())
    }
}
