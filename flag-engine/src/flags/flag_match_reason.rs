use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Why an evaluation resolved the way it did.
///
/// `NoRulesDefault` is part of the persisted taxonomy but the evaluator never produces it:
/// an enabled flag always resolves through a rule or through the rollout.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    FlagDisabled,
    RuleMatch,
    RolloutIncluded,
    RolloutExcluded,
    NoRulesDefault,
}
