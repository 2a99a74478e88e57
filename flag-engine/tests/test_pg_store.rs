//! Store tests against a real Postgres at `DEFAULT_TEST_CONFIG.database_url`.
//!
//! Start the database from docker-compose and run with `cargo test -- --ignored`.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use flag_engine::flags::flag_match_reason::EvaluationReason;
use flag_engine::flags::flag_matching::evaluate_flag;
use flag_engine::flags::flag_models::{CallerContext, Flag, FlagUpdate, NewFlag, NewRule, RuleType};
use flag_engine::store::postgres::PgStore;
use flag_engine::store::{EvaluationStore, FlagAdminStore, FlagStore, StoreError};
use flag_engine::test_utils::{random_string, setup_pg_store, test_record};

async fn insert_flag(store: &PgStore, enabled: bool) -> Flag {
    store
        .insert_flag(NewFlag {
            name: random_string("pg_flag_"),
            description: None,
            enabled,
            rollout_percentage: 0,
            created_by: Some("tests".to_string()),
        })
        .await
        .expect("Failed to insert flag")
}

fn new_rule(rule_type: RuleType, value: &str, priority: i32) -> NewRule {
    NewRule {
        rule_type,
        value: value.to_string(),
        enabled: true,
        priority,
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

#[tokio::test]
#[ignore = "needs Postgres"]
async fn it_buckets_evaluations_by_hour_result_and_reason() -> Result<()> {
    let store = setup_pg_store(None).await;
    let flag = insert_flag(&store, true).await;

    for (result, when) in [
        (true, at(10, 5)),
        (true, at(10, 20)),
        (false, at(10, 40)),
        (true, at(11, 1)),
        (true, at(11, 30)),
        (true, at(11, 59)),
        // before the window
        (true, at(9, 59)),
    ] {
        store
            .append_evaluation_record(&test_record(flag.id, result, when))
            .await?;
    }

    let mut buckets = store.query_records_since(flag.id, at(10, 0)).await?;
    buckets.sort_by_key(|bucket| (bucket.hour, bucket.result));

    let summary: Vec<_> = buckets
        .iter()
        .map(|bucket| (bucket.hour, bucket.result, bucket.reason, bucket.count))
        .collect();
    assert_eq!(
        summary,
        vec![
            (at(10, 0), false, EvaluationReason::RolloutExcluded, 1),
            (at(10, 0), true, EvaluationReason::RolloutIncluded, 2),
            (at(11, 0), true, EvaluationReason::RolloutIncluded, 3),
        ]
    );
    Ok(())
}

#[tokio::test]
#[ignore = "needs Postgres"]
async fn it_loads_tied_rules_in_insertion_order() -> Result<()> {
    let store = setup_pg_store(None).await;
    let flag = insert_flag(&store, true).await;

    let first = store
        .insert_rule(flag.id, new_rule(RuleType::UserId, "user-1", 1))
        .await?;
    let second = store
        .insert_rule(flag.id, new_rule(RuleType::Country, "US", 1))
        .await?;
    let urgent = store
        .insert_rule(flag.id, new_rule(RuleType::Country, "DE", 5))
        .await?;

    let loaded = store.load_flag_by_id(flag.id).await?.expect("flag exists");
    let ids: Vec<Uuid> = loaded.rules.iter().map(|rule| rule.id).collect();
    assert_eq!(ids, vec![first.id, second.id, urgent.id]);

    let enabled = store.load_enabled_flags_with_rules().await?;
    let cached = enabled
        .iter()
        .find(|candidate| candidate.id == flag.id)
        .expect("enabled flag is loaded");
    assert_eq!(cached.rules, loaded.rules);

    let listed: Vec<Uuid> = store
        .list_rules(flag.id)
        .await?
        .iter()
        .map(|rule| rule.id)
        .collect();
    assert_eq!(listed, vec![urgent.id, first.id, second.id]);

    // both tied rules match; the earlier one wins
    let ctx = CallerContext::new("user-1").with_country("us");
    let outcome = evaluate_flag(&loaded, &ctx);
    assert_eq!(outcome.reason, EvaluationReason::RuleMatch);
    assert_eq!(outcome.matched_rule_id, Some(first.id));
    Ok(())
}

#[tokio::test]
#[ignore = "needs Postgres"]
async fn it_deletes_only_records_strictly_older_than_the_cutoff() -> Result<()> {
    let store = setup_pg_store(None).await;
    let flag = insert_flag(&store, true).await;
    let cutoff = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();

    store
        .append_evaluation_record(&test_record(flag.id, true, cutoff - Duration::seconds(1)))
        .await?;
    store
        .append_evaluation_record(&test_record(flag.id, false, cutoff))
        .await?;

    let deleted = store.delete_records_older_than(cutoff).await?;
    assert!(deleted >= 1);

    let remaining = store
        .query_records_since(flag.id, cutoff - Duration::days(1))
        .await?;
    assert_eq!(remaining.len(), 1);
    assert!(!remaining[0].result);
    assert_eq!(remaining[0].count, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "needs Postgres"]
async fn it_cascades_flag_deletion_to_rules_and_records() -> Result<()> {
    let store = setup_pg_store(None).await;
    let flag = insert_flag(&store, true).await;
    store
        .insert_rule(flag.id, new_rule(RuleType::Country, "FR", 0))
        .await?;
    store
        .append_evaluation_record(&test_record(flag.id, true, Utc::now()))
        .await?;

    assert!(store.delete_flag(flag.id).await?);

    assert!(store.load_flag_by_id(flag.id).await?.is_none());
    assert!(store.list_rules(flag.id).await?.is_empty());
    let since = Utc::now() - Duration::hours(1);
    assert!(store.query_records_since(flag.id, since).await?.is_empty());
    assert!(!store.delete_flag(flag.id).await?);
    Ok(())
}

#[tokio::test]
#[ignore = "needs Postgres"]
async fn it_reports_unique_violations_by_constraint() -> Result<()> {
    let store = setup_pg_store(None).await;
    let flag = insert_flag(&store, false).await;

    let duplicate_name = store
        .insert_flag(NewFlag {
            name: flag.name.clone(),
            description: None,
            enabled: false,
            rollout_percentage: 0,
            created_by: None,
        })
        .await;
    match duplicate_name {
        Err(StoreError::UniqueViolation(constraint)) => {
            assert_eq!(constraint, "feature_flags_name_key")
        }
        other => panic!("Expected UniqueViolation, got {:?}", other),
    }

    store
        .insert_rule(flag.id, new_rule(RuleType::EmailDomain, "@example.com", 0))
        .await?;
    let duplicate_rule = store
        .insert_rule(flag.id, new_rule(RuleType::EmailDomain, "@example.com", 3))
        .await;
    match duplicate_rule {
        Err(StoreError::UniqueViolation(constraint)) => {
            assert_eq!(constraint, "flag_rules_flag_type_value_key")
        }
        other => panic!("Expected UniqueViolation, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
#[ignore = "needs Postgres"]
async fn it_updates_only_the_given_fields_and_counts_flags() -> Result<()> {
    let store = setup_pg_store(None).await;
    let flag = insert_flag(&store, true).await;
    insert_flag(&store, false).await;

    let updated = store
        .update_flag(
            flag.id,
            FlagUpdate {
                description: Some("documented".to_string()),
                ..Default::default()
            },
        )
        .await?
        .expect("flag exists");
    assert_eq!(updated.description.as_deref(), Some("documented"));
    assert!(updated.enabled);
    assert_eq!(updated.rollout_percentage, 0);
    assert!(updated.updated_at >= flag.updated_at);

    assert!(store
        .update_flag(Uuid::now_v7(), FlagUpdate::default())
        .await?
        .is_none());

    let counts = store.count_flags().await?;
    assert!(counts.enabled >= 1);
    assert!(counts.total > counts.enabled);
    Ok(())
}
