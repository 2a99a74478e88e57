//! Administrative CRUD over flags and rules.
//!
//! Handlers only translate HTTP into [`FlagAdminService`](crate::flags::flag_admin::FlagAdminService)
//! calls; validation, conflict detection and cache invalidation all live in the service.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::endpoint::{decode_path, decode_query};
use crate::api::errors::FlagError;
use crate::api::types::{
    ActionResponse, CreateFlagRequest, CreateRuleRequest, FlagResponse, RuleResponse,
    ToggleQuery, UpdateFlagRequest,
};
use crate::flags::flag_models::{FlagId, RuleId};
use crate::router;

fn decode_json<T>(json: Result<Json<T>, JsonRejection>) -> Result<T, FlagError> {
    json.map(|Json(value)| value)
        .map_err(|e| FlagError::RequestDecodingError(e.body_text()))
}

pub async fn create_flag(
    State(state): State<router::State>,
    body: Result<Json<CreateFlagRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FlagResponse>), FlagError> {
    let request = decode_json(body)?;
    let flag = state.admin.create_flag(request.into()).await?;
    Ok((StatusCode::CREATED, Json(FlagResponse::with_rules(flag))))
}

pub async fn list_flags(
    State(state): State<router::State>,
) -> Result<Json<Vec<FlagResponse>>, FlagError> {
    let flags = state.admin.list_flags().await?;
    Ok(Json(flags.into_iter().map(FlagResponse::summary).collect()))
}

pub async fn get_flag(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
) -> Result<Json<FlagResponse>, FlagError> {
    let flag = state.admin.get_flag(decode_path(path)?).await?;
    Ok(Json(FlagResponse::with_rules(flag)))
}

pub async fn get_flag_by_name(
    State(state): State<router::State>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<FlagResponse>, FlagError> {
    let flag = state.admin.get_flag_by_name(&decode_path(path)?).await?;
    Ok(Json(FlagResponse::with_rules(flag)))
}

pub async fn update_flag(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
    body: Result<Json<UpdateFlagRequest>, JsonRejection>,
) -> Result<Json<FlagResponse>, FlagError> {
    let id = decode_path(path)?;
    let request = decode_json(body)?;
    let flag = state.admin.update_flag(id, request.into()).await?;
    Ok(Json(FlagResponse::with_rules(flag)))
}

pub async fn toggle_flag(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
    query: Result<Query<ToggleQuery>, QueryRejection>,
) -> Result<Json<FlagResponse>, FlagError> {
    let id = decode_path(path)?;
    let ToggleQuery { enabled } = decode_query(query)?;
    let flag = state.admin.toggle_flag(id, enabled).await?;
    Ok(Json(FlagResponse::with_rules(flag)))
}

pub async fn delete_flag(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
) -> Result<Json<ActionResponse>, FlagError> {
    state.admin.delete_flag(decode_path(path)?).await?;
    Ok(Json(ActionResponse::ok("Flag deleted")))
}

pub async fn add_rule(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
    body: Result<Json<CreateRuleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RuleResponse>), FlagError> {
    let flag_id = decode_path(path)?;
    let request = decode_json(body)?;
    let rule = state.admin.add_rule(flag_id, request.into()).await?;
    Ok((StatusCode::CREATED, Json(rule.into())))
}

pub async fn list_rules(
    State(state): State<router::State>,
    path: Result<Path<FlagId>, PathRejection>,
) -> Result<Json<Vec<RuleResponse>>, FlagError> {
    let rules = state.admin.list_rules(decode_path(path)?).await?;
    Ok(Json(rules.into_iter().map(RuleResponse::from).collect()))
}

pub async fn toggle_rule(
    State(state): State<router::State>,
    path: Result<Path<RuleId>, PathRejection>,
    query: Result<Query<ToggleQuery>, QueryRejection>,
) -> Result<Json<ActionResponse>, FlagError> {
    let rule_id = decode_path(path)?;
    let ToggleQuery { enabled } = decode_query(query)?;
    state.admin.toggle_rule(rule_id, enabled).await?;
    Ok(Json(ActionResponse::ok("Rule toggled")))
}

pub async fn delete_rule(
    State(state): State<router::State>,
    path: Result<Path<RuleId>, PathRejection>,
) -> Result<Json<ActionResponse>, FlagError> {
    state.admin.delete_rule(decode_path(path)?).await?;
    Ok(Json(ActionResponse::ok("Rule deleted")))
}
