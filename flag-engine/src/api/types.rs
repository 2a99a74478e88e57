use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::errors::FlagError;
use crate::flags::flag_matching::EvaluationOutcome;
use crate::flags::flag_models::{
    CallerContext, Flag, FlagId, FlagUpdate, NewFlag, NewRule, Rule, RuleId, RuleType,
};

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Caller attributes, from a JSON body or from the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "userEmail", alias = "email")]
    pub user_email: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl EvaluateRequest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FlagError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn into_context(self) -> Result<CallerContext, FlagError> {
        let subject_id = non_blank(self.user_id).ok_or(FlagError::MissingSubjectId)?;
        Ok(CallerContext {
            subject_id,
            email: non_blank(self.user_email),
            country: non_blank(self.country),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResponse {
    pub flags: HashMap<String, bool>,
    pub details: HashMap<String, EvaluationOutcome>,
}

impl FromIterator<(String, EvaluationOutcome)> for EvaluationResponse {
    fn from_iter<I: IntoIterator<Item = (String, EvaluationOutcome)>>(iter: I) -> Self {
        let mut response = EvaluationResponse::default();
        for (name, outcome) in iter {
            response.flags.insert(name.clone(), outcome.result);
            response.details.insert(name, outcome);
        }
        response
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlagRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "rolloutPercentage")]
    pub rollout_percentage: i32,
    #[serde(default, alias = "createdBy")]
    pub created_by: Option<String>,
}

impl From<CreateFlagRequest> for NewFlag {
    fn from(request: CreateFlagRequest) -> Self {
        NewFlag {
            name: request.name,
            description: request.description,
            enabled: request.enabled,
            rollout_percentage: request.rollout_percentage,
            created_by: request.created_by,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateFlagRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, alias = "rolloutPercentage")]
    pub rollout_percentage: Option<i32>,
}

impl From<UpdateFlagRequest> for FlagUpdate {
    fn from(request: UpdateFlagRequest) -> Self {
        FlagUpdate {
            description: request.description,
            enabled: request.enabled,
            rollout_percentage: request.rollout_percentage,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRuleRequest {
    #[serde(alias = "ruleType")]
    pub rule_type: RuleType,
    #[serde(alias = "ruleValue", alias = "value")]
    pub rule_value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

impl From<CreateRuleRequest> for NewRule {
    fn from(request: CreateRuleRequest) -> Self {
        NewRule {
            rule_type: request.rule_type,
            value: request.rule_value,
            enabled: request.enabled,
            priority: request.priority,
        }
    }
}

/// Body of mutations that have nothing else to return.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        ActionResponse {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub total_flags: i64,
    pub enabled_flags: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToggleQuery {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleResponse {
    pub id: RuleId,
    pub flag_id: FlagId,
    pub rule_type: RuleType,
    pub rule_value: String,
    pub enabled: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl From<Rule> for RuleResponse {
    fn from(rule: Rule) -> Self {
        RuleResponse {
            id: rule.id,
            flag_id: rule.flag_id,
            rule_type: rule.rule_type,
            rule_value: rule.value,
            enabled: rule.enabled,
            priority: rule.priority,
            created_at: rule.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagResponse {
    pub id: FlagId,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rollout_percentage: i32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RuleResponse>>,
    pub rules_count: usize,
}

impl FlagResponse {
    /// Full view, rules included.
    pub fn with_rules(flag: Flag) -> Self {
        let rules: Vec<RuleResponse> = flag.rules.into_iter().map(RuleResponse::from).collect();
        FlagResponse {
            id: flag.id,
            name: flag.name,
            description: flag.description,
            enabled: flag.enabled,
            rollout_percentage: flag.rollout_percentage,
            created_by: flag.created_by,
            created_at: flag.created_at,
            updated_at: flag.updated_at,
            rules_count: rules.len(),
            rules: Some(rules),
        }
    }

    /// Listing view without rules.
    pub fn summary(flag: Flag) -> Self {
        FlagResponse {
            rules: None,
            rules_count: 0,
            ..Self::with_rules(Flag {
                rules: vec![],
                ..flag
            })
        }
    }
}
