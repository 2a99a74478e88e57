use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

pub type FlagId = Uuid;
pub type RuleId = Uuid;

/// The kind of targeting predicate a rule applies. The set is closed: adding a type means
/// teaching `rule_matching::matches` about it, the compiler makes sure of that.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    UserId,
    EmailExact,
    EmailDomain,
    Country,
    PercentageGroup,
}

/// A single targeting predicate. Rules are owned by their flag; `flag_id` is only a plain
/// back-reference used when shaping responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub flag_id: FlagId,
    pub rule_type: RuleType,
    pub value: String,
    pub enabled: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub id: FlagId,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rollout_percentage: i32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Rules in insertion order. Evaluation re-sorts them by priority.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Flag {
    pub fn find_rule(&self, rule_type: RuleType, value: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.rule_type == rule_type && rule.value == value)
    }
}

/// Per-request caller attributes. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub subject_id: String,
    pub email: Option<String>,
    pub country: Option<String>,
}

impl CallerContext {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// The email domain including the leading `@`, e.g. `@example.com`.
    pub fn email_domain(&self) -> Option<&str> {
        let email = self.email.as_deref()?;
        email.find('@').map(|at| &email[at..])
    }
}

/// Input for creating a flag through the admin path.
#[derive(Debug, Clone)]
pub struct NewFlag {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rollout_percentage: i32,
    pub created_by: Option<String>,
}

/// Partial update of a flag. `None` leaves the field untouched; the name is immutable.
#[derive(Debug, Clone, Default)]
pub struct FlagUpdate {
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub rule_type: RuleType,
    pub value: String,
    pub enabled: bool,
    pub priority: i32,
}
