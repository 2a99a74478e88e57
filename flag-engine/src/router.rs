use std::future::ready;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::Json;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::types::ReadinessResponse;
use crate::api::{admin_endpoint, endpoint};
use crate::flags::flag_admin::FlagAdminService;
use crate::flags::flag_service::FlagEvaluationService;
use crate::health::HealthRegistry;
use crate::metrics_utils::track_metrics;
use crate::store::FlagStore;

#[derive(Clone)]
pub struct State {
    pub evaluation: Arc<FlagEvaluationService>,
    pub admin: Arc<FlagAdminService>,
    pub default_analytics_hours: u32,
}

pub fn router(
    state: State,
    store: Arc<dyn FlagStore>,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let status_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || readiness(store.clone())))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    let evaluation_router = Router::new()
        .route(
            "/api/flags/evaluate",
            post(endpoint::evaluate_all).get(endpoint::evaluate_all_from_query),
        )
        .route(
            "/api/flags/evaluate/:flag_name",
            post(endpoint::evaluate_one),
        )
        .route("/api/flags/:id/analytics", get(endpoint::flag_analytics));

    let admin_router = Router::new()
        .route(
            "/api/flags",
            post(admin_endpoint::create_flag).get(admin_endpoint::list_flags),
        )
        .route(
            "/api/flags/:id",
            get(admin_endpoint::get_flag)
                .put(admin_endpoint::update_flag)
                .delete(admin_endpoint::delete_flag),
        )
        .route("/api/flags/name/:name", get(admin_endpoint::get_flag_by_name))
        .route("/api/flags/:id/toggle", patch(admin_endpoint::toggle_flag))
        .route(
            "/api/flags/:id/rules",
            post(admin_endpoint::add_rule).get(admin_endpoint::list_rules),
        )
        .route(
            "/api/flags/rules/:rule_id/toggle",
            patch(admin_endpoint::toggle_rule),
        )
        .route("/api/flags/rules/:rule_id", delete(admin_endpoint::delete_rule));

    let router = Router::new()
        .merge(status_router)
        .merge(evaluation_router)
        .merge(admin_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is global, so it is installed once by the server and only rendered here.
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}

/// Ready once the store answers; reports how many flags it holds.
pub async fn readiness(
    store: Arc<dyn FlagStore>,
) -> Result<Json<ReadinessResponse>, (StatusCode, String)> {
    let counts = store.count_flags().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("flag store unavailable: {e}"),
        )
    })?;
    Ok(Json(ReadinessResponse {
        status: "ready",
        database: "up",
        total_flags: counts.total,
        enabled_flags: counts.enabled,
    }))
}

pub async fn index() -> &'static str {
    "flag engine"
}
