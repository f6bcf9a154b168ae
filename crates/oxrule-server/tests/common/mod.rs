#![allow(dead_code)]

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use oxrule_common::Metric;
use oxrule_datasource::fake::FakeQuerier;
use oxrule_engine::{config as rules, EngineSettings, Manager, NotifierProvider};
use oxrule_notify::fake::FakeNotifier;
use oxrule_notify::Notifier;
use oxrule_remotewrite::fake::FakeRwClient;
use oxrule_server::app;
use oxrule_server::config::ServerConfig;
use oxrule_server::state::AppState;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const RULES_YAML: &str = r#"
groups:
  - name: api
    rules:
      - alert: InstanceDown
        expr: up == 0
        labels:
          severity: page
        annotations:
          summary: "{{ $labels.instance }} is down"
      - record: job:up:sum
        expr: sum(up) by (job)
"#;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub rules_path: PathBuf,
    pub querier: FakeQuerier,
    pub notifier: FakeNotifier,
    pub rw: FakeRwClient,
    pub state: AppState,
    pub app: axum::Router,
}

impl TestContext {
    pub fn patterns(&self) -> Vec<String> {
        vec![self.rules_path.to_string_lossy().into_owned()]
    }

    /// Evaluates every running group once at the current time.
    pub async fn eval_all(&self) {
        let ctx = tokio_util::sync::CancellationToken::new();
        let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(self.notifier.clone())];
        let provider: NotifierProvider = Arc::new(move || notifiers.clone());
        for g in self.state.manager.groups() {
            let errs = g
                .exec_once(&ctx, Arc::clone(&provider), Some(Arc::new(self.rw.clone())), Utc::now())
                .await;
            assert!(errs.is_empty(), "unexpected evaluation errors: {errs:?}");
        }
    }
}

pub fn down_instance(instance: &str) -> Metric {
    Metric::instant(
        &[("__name__", "up"), ("job", "api"), ("instance", instance)],
        Utc::now().timestamp(),
        0.0,
    )
}

pub async fn build_test_context() -> Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let rules_path = temp_dir.path().join("rules.yml");
    std::fs::write(&rules_path, RULES_YAML)?;

    let querier = FakeQuerier::new();
    let notifier = FakeNotifier::new();
    let rw = FakeRwClient::new();

    let config: ServerConfig = toml::from_str(&format!(
        r#"
        rule_files = [{:?}]
        external_url = "http://oxrule:8880"

        [datasource]
        url = "http://localhost:8428"

        [evaluation]
        skip_rand_sleep_on_group_start = true
        eval_delay = "0s"
        "#,
        rules_path.to_string_lossy()
    ))?;

    let settings = Arc::new(EngineSettings {
        // long interval keeps started groups idle; tests drive evaluation
        default_interval: std::time::Duration::from_secs(3600),
        ..config.evaluation.clone()
    });
    let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(notifier.clone())];
    let provider: NotifierProvider = Arc::new(move || notifiers.clone());
    let manager = Arc::new(Manager::new(
        Arc::new(querier.clone()),
        settings,
        provider,
        Some(Arc::new(rw.clone())),
        None,
    ));
    manager.start(&rules::load(&config.rule_files)?).await;
    wait_for_first_evaluation(&manager).await;

    let state = AppState {
        manager,
        metrics: None,
        start_time: Utc::now(),
        config: Arc::new(config),
    };
    let app = app::build_http_app(state.clone());

    Ok(TestContext {
        temp_dir,
        rules_path,
        querier,
        notifier,
        rw,
        state,
        app,
    })
}

/// Started groups evaluate once right away; let that settle before tests
/// drive evaluation.
pub async fn wait_for_first_evaluation(manager: &Manager) {
    let settled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while manager.groups().iter().any(|g| g.last_evaluation().is_none()) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "groups did not evaluate in time");
}

pub async fn request_no_body(
    app: &axum::Router,
    method: &str,
    uri: &str,
) -> (StatusCode, Value, Option<String>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");

    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should succeed");

    let status = resp.status();
    let trace_id = resp
        .headers()
        .get("X-Trace-Id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body, trace_id)
}

pub fn assert_ok_envelope(body: &Value) {
    assert_eq!(body["err_code"], 0, "unexpected envelope: {body}");
    assert!(body["trace_id"].as_str().is_some_and(|s| !s.is_empty()));
}
