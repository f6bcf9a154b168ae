mod common;

use anyhow::{anyhow, Result};
use common::{build_test_context, request_no_body};
use std::collections::{BTreeSet, HashSet};

#[tokio::test]
async fn openapi_paths_should_be_covered_by_test_matrix() -> Result<()> {
    let ctx = build_test_context().await?;
    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/openapi.json").await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let Some(paths) = body["paths"].as_object() else {
        return Err(anyhow!("openapi paths should be object"));
    };

    let mut exposed: BTreeSet<String> = BTreeSet::new();
    for (path, methods) in paths {
        let Some(methods) = methods.as_object() else {
            return Err(anyhow!("path methods should be object for {path}"));
        };
        for method in methods.keys() {
            let method = method.to_ascii_uppercase();
            exposed.insert(format!("{method} {path}"));
        }
    }

    let covered: HashSet<String> = [
        "GET /v1/health",
        "GET /v1/groups",
        "GET /v1/alerts",
        "GET /v1/groups/{group_id}/rules/{rule_id}",
        "GET /v1/groups/{group_id}/alerts/{alert_id}",
    ]
    .into_iter()
    .map(ToString::to_string)
    .collect();

    let uncovered: Vec<&String> = exposed.iter().filter(|p| !covered.contains(*p)).collect();
    assert!(
        uncovered.is_empty(),
        "openapi paths without test coverage: {uncovered:?}"
    );
    let stale: Vec<&String> = covered.iter().filter(|p| !exposed.contains(*p)).collect();
    assert!(stale.is_empty(), "covered paths no longer exposed: {stale:?}");
    Ok(())
}
