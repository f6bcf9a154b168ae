use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use utoipa::openapi::OpenApi;

/// Serves the merged API description as YAML.
pub fn yaml_route(spec: Arc<OpenApi>) -> Router {
    Router::new().route(
        "/v1/openapi.yaml",
        get(move || {
            let spec = Arc::clone(&spec);
            async move { openapi_yaml(&spec) }
        }),
    )
}

fn openapi_yaml(spec: &OpenApi) -> impl IntoResponse {
    match serde_yaml::to_string(spec) {
        Ok(yaml) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/yaml")], yaml).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize openapi document: {e}"),
        )
            .into_response(),
    }
}
