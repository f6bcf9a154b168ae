mod common;

use anyhow::{anyhow, Result};
use axum::http::StatusCode;
use common::{assert_ok_envelope, build_test_context, down_instance, request_no_body};
use std::collections::BTreeSet;

#[tokio::test]
async fn health_reports_running_groups() -> Result<()> {
    let ctx = build_test_context().await?;
    let (status, body, trace_id) = request_no_body(&ctx.app, "GET", "/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_ok_envelope(&body);
    assert_eq!(body["data"]["group_count"], 1);
    assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));

    let trace_id = trace_id.ok_or_else(|| anyhow!("X-Trace-Id header should be set"))?;
    assert_eq!(body["trace_id"], trace_id.as_str());
    Ok(())
}

#[tokio::test]
async fn groups_list_rules_with_their_health() -> Result<()> {
    let ctx = build_test_context().await?;
    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/groups").await;
    assert_eq!(status, StatusCode::OK);
    assert_ok_envelope(&body);

    let groups = body["data"]
        .as_array()
        .ok_or_else(|| anyhow!("data should be an array"))?;
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group["name"], "api");
    assert_eq!(group["type"], "prometheus");
    assert_eq!(group["interval_secs"], 3600.0);
    assert!(group["file"]
        .as_str()
        .is_some_and(|f| f.ends_with("rules.yml")));
    assert!(group["last_evaluation"].is_string());

    let rules = group["rules"]
        .as_array()
        .ok_or_else(|| anyhow!("rules should be an array"))?;
    let kinds: BTreeSet<&str> = rules.iter().filter_map(|r| r["type"].as_str()).collect();
    assert_eq!(kinds, BTreeSet::from(["alerting", "recording"]));
    for rule in rules {
        assert_eq!(rule["health"], "ok", "rule {rule}");
        assert_eq!(rule["group_id"], group["id"]);
        // history is only served by the single-rule endpoint
        assert!(rule.get("updates").is_none());
    }
    Ok(())
}

#[tokio::test]
async fn firing_alerts_are_listed_and_delivered() -> Result<()> {
    let ctx = build_test_context().await?;
    ctx.querier
        .set(vec![down_instance("a:9100"), down_instance("b:9100")]);
    ctx.eval_all().await;

    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/alerts").await;
    assert_eq!(status, StatusCode::OK);
    let alerts = body["data"]
        .as_array()
        .ok_or_else(|| anyhow!("data should be an array"))?;
    assert_eq!(alerts.len(), 2);

    let mut instances = BTreeSet::new();
    for alert in alerts {
        assert_eq!(alert["name"], "InstanceDown");
        assert_eq!(alert["state"], "firing");
        assert_eq!(alert["expression"], "up == 0");
        assert_eq!(alert["labels"]["severity"], "page");
        assert_eq!(alert["labels"]["alertname"], "InstanceDown");
        let instance = alert["labels"]["instance"]
            .as_str()
            .ok_or_else(|| anyhow!("instance label missing"))?;
        assert_eq!(
            alert["annotations"]["summary"],
            format!("{instance} is down").as_str()
        );
        instances.insert(instance.to_string());
    }
    assert_eq!(
        instances,
        BTreeSet::from(["a:9100".to_string(), "b:9100".to_string()])
    );

    assert_eq!(ctx.notifier.alerts().len(), 2);
    assert!(ctx
        .rw
        .series()
        .iter()
        .any(|ts| ts.label("__name__") == Some("job:up:sum")));
    Ok(())
}

#[tokio::test]
async fn single_alert_is_addressable_by_its_source_path() -> Result<()> {
    let ctx = build_test_context().await?;
    ctx.querier.set(vec![down_instance("a:9100")]);
    ctx.eval_all().await;

    let (_, body, _) = request_no_body(&ctx.app, "GET", "/v1/alerts").await;
    let source = body["data"][0]["source"]
        .as_str()
        .ok_or_else(|| anyhow!("source should be a string"))?
        .to_string();

    let (status, body, _) = request_no_body(&ctx.app, "GET", &source).await;
    assert_eq!(status, StatusCode::OK);
    assert_ok_envelope(&body);
    assert_eq!(body["data"]["labels"]["instance"], "a:9100");
    assert_eq!(body["data"]["source"], source.as_str());
    assert_eq!(body["data"]["restored"], false);
    Ok(())
}

#[tokio::test]
async fn rule_details_include_evaluation_history() -> Result<()> {
    let ctx = build_test_context().await?;
    ctx.querier
        .set(vec![down_instance("a:9100"), down_instance("b:9100")]);
    ctx.eval_all().await;

    let (_, body, _) = request_no_body(&ctx.app, "GET", "/v1/groups").await;
    let group = &body["data"][0];
    let group_id = group["id"].as_str().unwrap_or_default().to_string();
    let recording = group["rules"]
        .as_array()
        .and_then(|rules| rules.iter().find(|r| r["type"] == "recording"))
        .ok_or_else(|| anyhow!("recording rule missing"))?;
    let rule_id = recording["id"].as_str().unwrap_or_default().to_string();

    let (status, body, _) = request_no_body(
        &ctx.app,
        "GET",
        &format!("/v1/groups/{group_id}/rules/{rule_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rule = &body["data"];
    assert_eq!(rule["name"], "job:up:sum");
    assert_eq!(rule["expression"], "sum(up) by (job)");
    assert_eq!(rule["last_samples"], 2);
    let updates = rule["updates"]
        .as_array()
        .ok_or_else(|| anyhow!("updates should be an array"))?;
    // the startup evaluation plus ours
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0]["samples"], 2);
    assert_eq!(updates[1]["samples"], 0);
    Ok(())
}

#[tokio::test]
async fn malformed_and_unknown_ids_are_rejected() -> Result<()> {
    let ctx = build_test_context().await?;
    let group_id = ctx.state.manager.groups()[0].id();

    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/groups/abc/rules/1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err_code"], 1001);
    assert!(body["data"].is_null());

    let (status, body, _) = request_no_body(
        &ctx.app,
        "GET",
        &format!("/v1/groups/{group_id}/alerts/not-a-number"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err_code"], 1001);

    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/groups/1/alerts/1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["err_code"], 1004);

    let (status, body, _) =
        request_no_body(&ctx.app, "GET", &format!("/v1/groups/{group_id}/rules/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["err_code"], 1004);

    let (status, _, _) =
        request_no_body(&ctx.app, "GET", &format!("/v1/groups/{group_id}/alerts/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn metrics_and_yaml_docs_are_served() -> Result<()> {
    let ctx = build_test_context().await?;

    let (status, body, trace_id) = request_no_body(&ctx.app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    // no recorder installed in tests
    assert!(body.is_null());
    assert!(trace_id.is_none());

    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/openapi.yaml").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body
        .as_str()
        .is_some_and(|yaml| yaml.contains("/v1/groups/{group_id}/rules/{rule_id}")));
    Ok(())
}
