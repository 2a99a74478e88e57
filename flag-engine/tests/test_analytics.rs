use anyhow::Result;
use assert_json_diff::assert_json_include;
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use flag_engine::test_utils::test_record;

use crate::common::TestEngine;

pub mod common;

#[tokio::test]
async fn it_summarizes_recorded_evaluations() -> Result<()> {
    let engine = TestEngine::start();
    let flag_id = engine.create_flag("fully_rolled_out", true, 100).await;

    for user in ["a", "b", "c", "d"] {
        let (status, _) = engine.evaluate(json!({"user_id": user})).await;
        assert_eq!(status, StatusCode::OK);
    }
    engine.wait_for_records(4).await;

    let (status, summary) = engine
        .get(&format!("/api/flags/{flag_id}/analytics"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: summary.clone(),
        expected: json!({
            "flag_id": flag_id,
            "flag_name": "fully_rolled_out",
            "window_hours": 24,
            "total_evaluations": 4,
            "enabled_count": 4,
            "disabled_count": 0,
            "enabled_percentage": 100.0,
            "configured_rollout_percentage": 100,
            "evaluations_by_reason": {"ROLLOUT_INCLUDED": 4}
        })
    );
    let series_total: i64 = summary["evaluations_over_time"]
        .as_array()
        .unwrap()
        .iter()
        .map(|point| point["total_count"].as_i64().unwrap())
        .sum();
    assert_eq!(series_total, 4);
    Ok(())
}

#[tokio::test]
async fn it_rounds_percentages_and_respects_the_window() -> Result<()> {
    let engine = TestEngine::start();
    let flag_id = engine.create_flag("partial", true, 50).await;
    let id = Uuid::parse_str(&flag_id)?;

    let now = Utc::now();
    engine.store.seed_record(test_record(id, true, now));
    engine.store.seed_record(test_record(id, true, now));
    engine.store.seed_record(test_record(id, false, now));
    // outside a 2 hour window
    engine
        .store
        .seed_record(test_record(id, false, now - Duration::hours(5)));

    let (status, summary) = engine
        .get(&format!("/api/flags/{flag_id}/analytics?hours=2"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: summary,
        expected: json!({
            "window_hours": 2,
            "total_evaluations": 3,
            "enabled_count": 2,
            "disabled_count": 1,
            "enabled_percentage": 66.67,
            "evaluations_by_reason": {"ROLLOUT_INCLUDED": 2, "ROLLOUT_EXCLUDED": 1}
        })
    );

    let (_, wide) = engine
        .get(&format!("/api/flags/{flag_id}/analytics?hours=24"))
        .await;
    assert_eq!(wide["total_evaluations"], 4);
    assert_eq!(wide["enabled_percentage"], 50.0);
    Ok(())
}

#[tokio::test]
async fn it_reports_zero_for_a_flag_without_history() -> Result<()> {
    let engine = TestEngine::start();
    let flag_id = engine.create_flag("quiet", false, 0).await;

    let (status, summary) = engine
        .get(&format!("/api/flags/{flag_id}/analytics?hours=1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: summary,
        expected: json!({
            "total_evaluations": 0,
            "enabled_percentage": 0.0,
            "evaluations_by_reason": {},
            "evaluations_over_time": []
        })
    );
    Ok(())
}

#[tokio::test]
async fn it_rejects_bad_windows_and_unknown_flags() -> Result<()> {
    let engine = TestEngine::start();
    let flag_id = engine.create_flag("measured", true, 10).await;

    for hours in ["0", "-3", "100000"] {
        let (status, body) = engine
            .get(&format!("/api/flags/{flag_id}/analytics?hours={hours}"))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "hours={hours}");
        assert_eq!(body["error"], "invalid_analytics_window");
    }

    let (status, _) = engine
        .get(&format!("/api/flags/{flag_id}/analytics?hours=soon"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = engine
        .get(&format!("/api/flags/{}/analytics", Uuid::now_v7()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "flag_not_found");
    Ok(())
}

#[tokio::test]
async fn it_drops_history_with_the_flag() -> Result<()> {
    let engine = TestEngine::start();
    let flag_id = engine.create_flag("short_lived", true, 100).await;
    engine.evaluate(json!({"user_id": "someone"})).await;
    engine.wait_for_records(1).await;

    let (status, _) = engine.delete(&format!("/api/flags/{flag_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(engine.store.records().is_empty());
    Ok(())
}
