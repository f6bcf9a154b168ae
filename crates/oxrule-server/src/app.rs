use crate::state::AppState;
use crate::{api, logging, openapi};
use axum::extract::State;
use axum::http::header;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "oxrule API",
        description = "Alerting and recording rule evaluation",
    ),
    tags(
        (name = "Health", description = "Service health"),
        (name = "Rules", description = "Rule groups and their evaluation state"),
        (name = "Alerts", description = "Pending and firing alerts")
    )
)]
struct ApiDoc;

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub fn build_http_app(state: AppState) -> Router {
    let (api_router, api_spec) = api::api_routes().split_for_parts();

    let mut merged_spec = ApiDoc::openapi();
    merged_spec.merge(api_spec);
    let spec = Arc::new(merged_spec);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let json_spec = Arc::clone(&spec);
    api_router
        .route("/metrics", get(render_metrics))
        .with_state(state)
        .route(
            "/v1/openapi.json",
            get(move || {
                let spec = Arc::clone(&json_spec);
                async move { Json(spec.as_ref().clone()) }
            }),
        )
        .merge(openapi::yaml_route(spec))
        .layer(cors)
        .layer(middleware::from_fn(logging::request_logging))
}
