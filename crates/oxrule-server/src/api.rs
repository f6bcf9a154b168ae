use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use oxrule_common::{Alert, AlertState};
use oxrule_engine::{Group, Rule, StateEntry};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Error body.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
}

/// Envelope of every JSON response.
#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    /// 0 on success.
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "internal_error" => 1500,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Serialize, ToSchema)]
struct HealthResponse {
    version: String,
    uptime_secs: i64,
    /// Number of running rule groups.
    group_count: usize,
}

/// Service health.
#[utoipa::path(
    get,
    path = "/v1/health",
    tag = "Health",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
async fn health(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    success_response(
        StatusCode::OK,
        &trace_id,
        HealthResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: (Utc::now() - state.start_time).num_seconds(),
            group_count: state.manager.groups().len(),
        },
    )
}

/// An alert as exposed by the API. IDs are strings so 64-bit values
/// survive JSON number parsing.
#[derive(Serialize, ToSchema)]
pub struct AlertResponse {
    pub id: String,
    pub group_id: String,
    pub rule_id: String,
    pub name: String,
    pub state: String,
    pub value: f64,
    pub expression: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub active_at: DateTime<Utc>,
    pub restored: bool,
    /// Path of this alert in the API.
    pub source: String,
}

impl AlertResponse {
    fn new(a: &Alert, rule_id: u64) -> Self {
        Self {
            id: a.id.to_string(),
            group_id: a.group_id.to_string(),
            rule_id: rule_id.to_string(),
            name: a.name.clone(),
            state: a.state.to_string(),
            value: a.value,
            expression: a.expr.clone(),
            labels: a.labels.clone(),
            annotations: a.annotations.clone(),
            active_at: a.active_at,
            restored: a.restored,
            source: format!("/v1/groups/{}/alerts/{}", a.group_id, a.id),
        }
    }
}

/// One evaluation of a rule.
#[derive(Serialize, ToSchema)]
pub struct RuleUpdate {
    pub time: Option<DateTime<Utc>>,
    pub at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub samples: usize,
    pub series_fetched: Option<usize>,
    pub error: Option<String>,
    pub curl: String,
}

impl From<StateEntry> for RuleUpdate {
    fn from(e: StateEntry) -> Self {
        Self {
            time: e.time,
            at: e.at,
            duration_secs: e.duration.as_secs_f64(),
            samples: e.samples,
            series_fetched: e.series_fetched,
            error: e.err,
            curl: e.curl,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct RuleResponse {
    pub id: String,
    pub group_id: String,
    pub name: String,
    /// `alerting` or `recording`.
    #[serde(rename = "type")]
    pub kind: String,
    pub expression: String,
    pub for_secs: i64,
    pub keep_firing_for_secs: i64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// `ok`, `err` or `unknown` before the first evaluation.
    pub health: String,
    pub last_error: Option<String>,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub last_samples: usize,
    pub last_series_fetched: Option<usize>,
    pub evaluation_time_secs: f64,
    pub alerts: Vec<AlertResponse>,
    /// Evaluation history, newest first; only filled for a single rule.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<RuleUpdate>,
}

impl RuleResponse {
    fn new(rule: &Rule, group_id: u64, with_updates: bool) -> Self {
        let last = rule.last_state();
        let health = match (&last.time, &last.err) {
            (None, _) => "unknown",
            (Some(_), Some(_)) => "err",
            (Some(_), None) => "ok",
        };
        let mut resp = Self {
            id: rule.id().to_string(),
            group_id: group_id.to_string(),
            name: rule.name().to_string(),
            kind: rule.kind().to_string(),
            expression: String::new(),
            for_secs: 0,
            keep_firing_for_secs: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            health: health.to_string(),
            last_error: last.err.clone(),
            last_evaluation: last.time,
            last_samples: last.samples,
            last_series_fetched: last.series_fetched,
            evaluation_time_secs: last.duration.as_secs_f64(),
            alerts: Vec::new(),
            updates: Vec::new(),
        };
        match rule {
            Rule::Alerting(ar) => {
                let spec = ar.spec();
                resp.expression = spec.expr;
                resp.for_secs = spec.for_duration.num_seconds();
                resp.keep_firing_for_secs = spec.keep_firing_for.num_seconds();
                resp.labels = spec.labels;
                resp.annotations = spec.annotations;
                resp.alerts = ar
                    .alerts()
                    .iter()
                    .filter(|a| a.state != AlertState::Inactive)
                    .map(|a| AlertResponse::new(a, ar.id()))
                    .collect();
            }
            Rule::Recording(rr) => {
                let spec = rr.spec();
                resp.expression = spec.expr;
                resp.labels = spec.labels;
            }
        }
        if with_updates {
            resp.updates = rule
                .state_entries()
                .into_iter()
                .filter(|e| e.time.is_some())
                .map(RuleUpdate::from)
                .collect();
        }
        resp
    }
}

#[derive(Serialize, ToSchema)]
pub struct GroupResponse {
    pub id: String,
    pub name: String,
    pub file: String,
    pub interval_secs: f64,
    pub eval_offset_secs: Option<f64>,
    pub eval_delay_secs: Option<f64>,
    pub concurrency: usize,
    pub limit: usize,
    #[serde(rename = "type")]
    pub datasource_type: String,
    pub labels: BTreeMap<String, String>,
    pub headers: Vec<String>,
    pub notifier_headers: Vec<String>,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub rules: Vec<RuleResponse>,
}

/// Header values are not exposed, only their names.
fn header_names(headers: &BTreeMap<String, String>) -> Vec<String> {
    headers.keys().cloned().collect()
}

impl GroupResponse {
    fn new(g: &Group) -> Self {
        let spec = g.spec();
        Self {
            id: g.id().to_string(),
            name: g.name().to_string(),
            file: g.file().to_string(),
            interval_secs: g.interval().as_secs_f64(),
            eval_offset_secs: g.eval_offset().map(|d| d.as_secs_f64()),
            eval_delay_secs: g.eval_delay().map(|d| d.as_secs_f64()),
            concurrency: spec.concurrency,
            limit: spec.limit,
            datasource_type: spec.datasource_type.clone(),
            labels: spec.labels.clone(),
            headers: header_names(&spec.headers),
            notifier_headers: header_names(&spec.notifier_headers),
            last_evaluation: g.last_evaluation(),
            rules: spec
                .rules
                .iter()
                .map(|r| RuleResponse::new(r, g.id(), false))
                .collect(),
        }
    }
}

/// Running groups with their rules.
#[utoipa::path(
    get,
    path = "/v1/groups",
    tag = "Rules",
    responses((status = 200, description = "Rule groups", body = Vec<GroupResponse>))
)]
async fn list_groups(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let mut groups: Vec<GroupResponse> = state
        .manager
        .groups()
        .iter()
        .map(|g| GroupResponse::new(g))
        .collect();
    groups.sort_by(|a, b| a.file.cmp(&b.file).then_with(|| a.name.cmp(&b.name)));
    success_response(StatusCode::OK, &trace_id, groups)
}

/// Pending and firing alerts of every group.
#[utoipa::path(
    get,
    path = "/v1/alerts",
    tag = "Alerts",
    responses((status = 200, description = "Active alerts", body = Vec<AlertResponse>))
)]
async fn list_alerts(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let mut alerts = Vec::new();
    for g in state.manager.groups() {
        for rule in g.rules() {
            let Some(ar) = rule.as_alerting() else {
                continue;
            };
            alerts.extend(
                ar.alerts()
                    .iter()
                    .filter(|a| a.state != AlertState::Inactive)
                    .map(|a| AlertResponse::new(a, ar.id())),
            );
        }
    }
    alerts.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    success_response(StatusCode::OK, &trace_id, alerts)
}

fn parse_id(raw: &str, what: &str, trace_id: &str) -> Result<u64, Response> {
    raw.parse().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            &format!("invalid {what} {raw:?}"),
        )
    })
}

fn find_group(state: &AppState, raw: &str, trace_id: &str) -> Result<Arc<Group>, Response> {
    let id = parse_id(raw, "group_id", trace_id)?;
    state.manager.group(id).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            trace_id,
            "not_found",
            &format!("group {raw} not found"),
        )
    })
}

/// A single rule with its evaluation history.
#[utoipa::path(
    get,
    path = "/v1/groups/{group_id}/rules/{rule_id}",
    tag = "Rules",
    params(
        ("group_id" = String, Path, description = "Group ID"),
        ("rule_id" = String, Path, description = "Rule ID")
    ),
    responses(
        (status = 200, description = "Rule details", body = RuleResponse),
        (status = 400, description = "Malformed ID", body = ApiError),
        (status = 404, description = "Unknown group or rule", body = ApiError)
    )
)]
async fn get_rule(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((group_id, rule_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let group = match find_group(&state, &group_id, &trace_id) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let id = match parse_id(&rule_id, "rule_id", &trace_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match group.rules().iter().find(|r| r.id() == id) {
        Some(rule) => success_response(
            StatusCode::OK,
            &trace_id,
            RuleResponse::new(rule, group.id(), true),
        ),
        None => error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("rule {rule_id} not found in group {group_id}"),
        ),
    }
}

/// A single alert; target of the links sent to notifiers.
#[utoipa::path(
    get,
    path = "/v1/groups/{group_id}/alerts/{alert_id}",
    tag = "Alerts",
    params(
        ("group_id" = String, Path, description = "Group ID"),
        ("alert_id" = String, Path, description = "Alert ID")
    ),
    responses(
        (status = 200, description = "Alert details", body = AlertResponse),
        (status = 400, description = "Malformed ID", body = ApiError),
        (status = 404, description = "Unknown group or alert", body = ApiError)
    )
)]
async fn get_alert(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((group_id, alert_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let group = match find_group(&state, &group_id, &trace_id) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let id = match parse_id(&alert_id, "alert_id", &trace_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let found = group.rules().iter().find_map(|r| {
        let ar = r.as_alerting()?;
        ar.alert(id).map(|a| AlertResponse::new(&a, ar.id()))
    });
    match found {
        Some(alert) => success_response(StatusCode::OK, &trace_id, alert),
        None => error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("alert {alert_id} not found in group {group_id}"),
        ),
    }
}

pub fn api_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .routes(routes!(list_groups))
        .routes(routes!(list_alerts))
        .routes(routes!(get_rule))
        .routes(routes!(get_alert))
}
