pub mod flag_admin;
pub mod flag_cache;
pub mod flag_match_reason;
pub mod flag_matching;
pub mod flag_models;
pub mod flag_service;
pub mod rollout;
pub mod rule_matching;
