use crate::flags::flag_models::{CallerContext, Rule, RuleType};
use crate::flags::rollout::in_bucket;

/// Decides whether a single targeting rule applies to the caller.
///
/// Total by construction: missing caller attributes and malformed rule values are
/// non-matches, never errors.
pub fn matches(rule: &Rule, ctx: &CallerContext) -> bool {
    match rule.rule_type {
        RuleType::UserId => rule.value == ctx.subject_id,
        RuleType::EmailExact => ctx
            .email
            .as_deref()
            .is_some_and(|email| folded(email) == folded(&rule.value)),
        RuleType::EmailDomain => ctx
            .email_domain()
            .is_some_and(|domain| folded(domain).ends_with(&folded(&rule.value))),
        RuleType::Country => ctx
            .country
            .as_deref()
            .is_some_and(|country| folded(country) == folded(&rule.value)),
        RuleType::PercentageGroup => match rule.value.parse::<i32>() {
            Ok(percentage) => in_bucket(&ctx.subject_id, percentage),
            Err(_) => false,
        },
    }
}

/// Unicode-aware case folding shared by every case-insensitive matcher.
fn folded(value: &str) -> String {
    value.to_lowercase()
}
