use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use crate::flags::flag_match_reason::EvaluationReason;
use crate::flags::flag_models::{CallerContext, Flag, Rule, RuleId};
use crate::flags::rollout::{in_bucket, rollout_key};
use crate::flags::rule_matching::matches;

/// Result of evaluating one flag for one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub result: bool,
    pub reason: EvaluationReason,
    pub matched_rule_id: Option<RuleId>,
    pub explanation: String,
}

impl EvaluationOutcome {
    fn disabled() -> Self {
        Self {
            result: false,
            reason: EvaluationReason::FlagDisabled,
            matched_rule_id: None,
            explanation: "Flag is globally disabled".to_string(),
        }
    }

    fn rule_match(rule: &Rule) -> Self {
        Self {
            result: true,
            reason: EvaluationReason::RuleMatch,
            matched_rule_id: Some(rule.id),
            explanation: format!("Matched rule: {} = {}", rule.rule_type, rule.value),
        }
    }

    fn rollout(included: bool, percentage: i32) -> Self {
        if included {
            Self {
                result: true,
                reason: EvaluationReason::RolloutIncluded,
                matched_rule_id: None,
                explanation: format!("User included in {percentage}% rollout"),
            }
        } else {
            Self {
                result: false,
                reason: EvaluationReason::RolloutExcluded,
                matched_rule_id: None,
                explanation: format!("User excluded from {percentage}% rollout"),
            }
        }
    }

    /// Outcome for a flag name that is not in the working set. Unknown flags are off, not
    /// an error.
    pub fn unknown_flag(name: &str) -> Self {
        Self {
            result: false,
            reason: EvaluationReason::FlagDisabled,
            matched_rule_id: None,
            explanation: format!("Flag not found: {name}"),
        }
    }
}

/// Enabled rules in evaluation order: priority descending, insertion order among equals.
pub fn ordered_rules(flag: &Flag) -> Vec<&Rule> {
    let mut rules: Vec<&Rule> = flag.rules.iter().filter(|rule| rule.enabled).collect();
    // sort_by_key is stable, which keeps ties in insertion order
    rules.sort_by_key(|rule| Reverse(rule.priority));
    rules
}

/// Evaluates a flag snapshot for a caller: kill switch, then rules, then rollout.
pub fn evaluate_flag(flag: &Flag, ctx: &CallerContext) -> EvaluationOutcome {
    if !flag.enabled {
        return EvaluationOutcome::disabled();
    }

    if let Some(rule) = ordered_rules(flag)
        .into_iter()
        .find(|rule| matches(rule, ctx))
    {
        return EvaluationOutcome::rule_match(rule);
    }

    let included = in_bucket(
        &rollout_key(&flag.name, &ctx.subject_id),
        flag.rollout_percentage,
    );
    EvaluationOutcome::rollout(included, flag.rollout_percentage)
}
