use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{debug_handler, Json};
use bytes::Bytes;
use tracing::debug;

use crate::analytics::analytics_models::AnalyticsSummary;
use crate::api::errors::FlagError;
use crate::api::types::{AnalyticsQuery, EvaluateRequest, EvaluationResponse};
use crate::flags::flag_models::FlagId;
use crate::metrics_consts::FLAG_REQUESTS_COUNTER;
use crate::metrics_utils::inc;
use crate::router;

pub(crate) fn decode_path<T>(path: Result<Path<T>, PathRejection>) -> Result<T, FlagError> {
    path.map(|Path(value)| value)
        .map_err(|e| FlagError::RequestDecodingError(e.body_text()))
}

pub(crate) fn decode_query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, FlagError> {
    query
        .map(|Query(value)| value)
        .map_err(|e| FlagError::RequestDecodingError(e.body_text()))
}

fn count_request(endpoint: &'static str) {
    inc(
        FLAG_REQUESTS_COUNTER,
        &[("endpoint".to_string(), endpoint.to_string())],
        1,
    );
}

/// Evaluates every enabled flag for the caller described in the JSON body.
#[debug_handler]
pub async fn evaluate_all(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<EvaluationResponse>, FlagError> {
    count_request("evaluate_all");
    let ctx = EvaluateRequest::from_bytes(&body)?.into_context()?;
    debug!(subject_id = %ctx.subject_id, "evaluating all flags");

    let outcomes = state.evaluation.evaluate_all(&ctx).await?;
    Ok(Json(outcomes.into_iter().collect()))
}

/// Same as [`evaluate_all`], with the caller taken from the query string.
#[debug_handler]
pub async fn evaluate_all_from_query(
    State(state): State<router::State>,
    query: Result<Query<EvaluateRequest>, QueryRejection>,
) -> Result<Json<EvaluationResponse>, FlagError> {
    count_request("evaluate_all_query");
    let ctx = decode_query(query)?.into_context()?;

    let outcomes = state.evaluation.evaluate_all(&ctx).await?;
    Ok(Json(outcomes.into_iter().collect()))
}

/// Evaluates a single flag by name. Unknown names come back off rather than as a 404.
#[debug_handler]
pub async fn evaluate_one(
    State(state): State<router::State>,
    path: Result<Path<String>, PathRejection>,
    body: Bytes,
) -> Result<Json<EvaluationResponse>, FlagError> {
    count_request("evaluate_one");
    let name = decode_path(path)?;
    let ctx = EvaluateRequest::from_bytes(&body)?.into_context()?;

    let outcome = state.evaluation.evaluate_one(&name, &ctx).await?;
    Ok(Json(std::iter::once((name, outcome)).collect()))
}

#[debug_handler]
pub async fn flag_analytics(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<Json<AnalyticsSummary>, FlagError> {
    count_request("analytics");
    let flag_id = decode_path(path)?;
    let hours = decode_query(query)?
        .hours
        .unwrap_or(i64::from(state.default_analytics_hours));
    let window_hours =
        u32::try_from(hours).map_err(|_| FlagError::InvalidAnalyticsWindow(hours))?;

    let summary = state.evaluation.get_analytics(flag_id, window_hours).await?;
    Ok(Json(summary))
}
